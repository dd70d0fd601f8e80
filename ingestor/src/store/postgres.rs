use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::{AlertCandidate, RecordedReading, Store};
use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    Alert, AlertStatus, ClimateBand, Device, DeviceStatus, FeedingSchedule, NewAlert, NewDevice,
    NewReading, Reading,
};

const DEVICE_COLUMNS: &str =
    "device_id, mac_address, enclosure_id, firmware_version, status, last_seen";
const ALERT_COLUMNS: &str = "alert_id, enclosure_id, alert_type, message, status, created_at";

/// First key of the two-part advisory lock taken around alert inserts
const ALERT_LOCK_NAMESPACE: i32 = 0x5a4f;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects, runs the embedded migrations and returns the store.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn record_reading_once(
        &self,
        reading: &NewReading,
        alert: Option<&AlertCandidate>,
    ) -> Result<RecordedReading> {
        let mut tx = self.pool.begin().await?;

        // Lock before any write so concurrent evaluations queue in the same order.
        if let Some(candidate) = alert {
            lock_enclosure_alerts(&mut tx, candidate.alert.enclosure_id).await?;
        }

        let row = sqlx::query_as::<_, Reading>(
            r#"
            INSERT INTO sensor_reading (device_id, temperature, humidity, light, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING reading_id, device_id, temperature, humidity, light, recorded_at
            "#,
        )
        .bind(reading.device_id)
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.light)
        .bind(reading.recorded_at)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE iot_device
               SET status = $3, last_seen = $2
             WHERE device_id = $1
               AND (last_seen IS NULL OR last_seen < $2)
            "#,
        )
        .bind(reading.device_id)
        .bind(reading.recorded_at)
        .bind(DeviceStatus::Online.as_str())
        .execute(&mut *tx)
        .await?;

        let created = match alert {
            Some(candidate) => insert_deduplicated(&mut tx, candidate).await?,
            None => None,
        };

        tx.commit().await?;
        Ok(RecordedReading {
            reading: row,
            alert: created,
        })
    }
}

async fn lock_enclosure_alerts(
    tx: &mut Transaction<'_, Postgres>,
    enclosure_id: i32,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(ALERT_LOCK_NAMESPACE)
        .bind(enclosure_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_alert_row(tx: &mut Transaction<'_, Postgres>, alert: &NewAlert) -> Result<Alert> {
    let query = format!(
        "INSERT INTO alert (enclosure_id, alert_type, message, status, created_at) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {ALERT_COLUMNS}"
    );
    Ok(sqlx::query_as::<_, Alert>(&query)
        .bind(alert.enclosure_id)
        .bind(&alert.alert_type)
        .bind(&alert.message)
        .bind(AlertStatus::New.as_str())
        .bind(alert.created_at)
        .fetch_one(&mut **tx)
        .await?)
}

/// Runs the duplicate check and the insert inside `tx`, which must already
/// hold the enclosure's advisory lock.
async fn insert_deduplicated(
    tx: &mut Transaction<'_, Postgres>,
    candidate: &AlertCandidate,
) -> Result<Option<Alert>> {
    let alert = &candidate.alert;
    let open_query = format!(
        "SELECT {ALERT_COLUMNS} FROM alert \
         WHERE enclosure_id = $1 AND status = $2 \
         ORDER BY created_at DESC, alert_id DESC"
    );
    let open = sqlx::query_as::<_, Alert>(&open_query)
        .bind(alert.enclosure_id)
        .bind(AlertStatus::New.as_str())
        .fetch_all(&mut **tx)
        .await?;

    if candidate.policy.suppresses(alert, &open) {
        debug!(
            enclosure_id = alert.enclosure_id,
            alert_type = %alert.alert_type,
            "Duplicate alert suppressed"
        );
        return Ok(None);
    }

    Ok(Some(insert_alert_row(tx, alert).await?))
}

/// Names the unique constraint a registration tripped over.
fn registration_conflict(constraint: Option<&str>, device: &NewDevice) -> Error {
    match constraint {
        Some(c) if c.contains("enclosure") => Error::Conflict(format!(
            "Enclosure {} already has a device",
            device
                .enclosure_id
                .map_or_else(|| "?".to_string(), |id| id.to_string())
        )),
        _ => Error::Conflict(format!(
            "Device MAC already registered: {}",
            device.mac_address
        )),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn register_device(&self, device: NewDevice) -> Result<Device> {
        let query = format!(
            "INSERT INTO iot_device (mac_address, enclosure_id, firmware_version, status) \
             VALUES ($1, $2, $3, $4) RETURNING {DEVICE_COLUMNS}"
        );
        let status = device.status.unwrap_or(DeviceStatus::Offline);

        sqlx::query_as::<_, Device>(&query)
            .bind(&device.mac_address)
            .bind(device.enclosure_id)
            .bind(device.firmware_version.as_deref().unwrap_or("1.0.0"))
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                    registration_conflict(db_err.constraint(), &device)
                }
                _ => Error::Database(e),
            })
    }

    async fn device_by_mac(&self, mac_address: &str) -> Result<Option<Device>> {
        let query = format!("SELECT {DEVICE_COLUMNS} FROM iot_device WHERE mac_address = $1");
        Ok(sqlx::query_as::<_, Device>(&query)
            .bind(mac_address)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn device_by_id(&self, device_id: i32) -> Result<Option<Device>> {
        let query = format!("SELECT {DEVICE_COLUMNS} FROM iot_device WHERE device_id = $1");
        Ok(sqlx::query_as::<_, Device>(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn stale_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM iot_device WHERE last_seen < $1 ORDER BY device_id"
        );
        Ok(sqlx::query_as::<_, Device>(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn mark_offline(
        &self,
        device_id: i32,
        cutoff: DateTime<Utc>,
        alert: Option<NewAlert>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE iot_device
               SET status = $3
             WHERE device_id = $1
               AND status <> $3
               AND last_seen < $2
            "#,
        )
        .bind(device_id)
        .bind(cutoff)
        .bind(DeviceStatus::Offline.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(alert) = &alert {
            insert_alert_row(&mut tx, alert).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn record_reading(
        &self,
        reading: NewReading,
        alert: Option<AlertCandidate>,
    ) -> Result<RecordedReading> {
        let mut attempts = 0;
        let max_attempts = 5;

        loop {
            attempts += 1;
            match self.record_reading_once(&reading, alert.as_ref()).await {
                Ok(recorded) => return Ok(recorded),
                Err(e) => match &e {
                    Error::Database(db_err) => {
                        if attempts >= max_attempts || !is_transient_error(db_err) {
                            error!(
                                "Reading write failed permanently after {} attempts: {}",
                                attempts, e
                            );
                            return Err(e);
                        }

                        let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                        warn!(
                            "Reading write failed (attempt {}/{}), retrying in {}ms: {}",
                            attempts, max_attempts, wait_ms, db_err
                        );
                        DB_FAILURES_TOTAL.inc();
                        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                    }
                    _ => {
                        error!("Reading write failed with non-database error: {}", e);
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn prune_readings(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sensor_reading WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn latest_reading(&self, enclosure_id: i32) -> Result<Option<Reading>> {
        Ok(sqlx::query_as::<_, Reading>(
            r#"
            SELECT r.reading_id, r.device_id, r.temperature, r.humidity, r.light, r.recorded_at
              FROM sensor_reading r
              JOIN iot_device d ON d.device_id = r.device_id
             WHERE d.enclosure_id = $1
             ORDER BY r.recorded_at DESC, r.reading_id DESC
             LIMIT 1
            "#,
        )
        .bind(enclosure_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn reading_history(
        &self,
        enclosure_id: i32,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Reading>> {
        Ok(sqlx::query_as::<_, Reading>(
            r#"
            SELECT r.reading_id, r.device_id, r.temperature, r.humidity, r.light, r.recorded_at
              FROM sensor_reading r
              JOIN iot_device d ON d.device_id = r.device_id
             WHERE d.enclosure_id = $1
               AND ($2::timestamptz IS NULL OR r.recorded_at >= $2)
               AND ($3::timestamptz IS NULL OR r.recorded_at <= $3)
             ORDER BY r.recorded_at DESC, r.reading_id DESC
             LIMIT $4
            "#,
        )
        .bind(enclosure_id)
        .bind(start)
        .bind(end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn average_temperature(
        &self,
        enclosure_id: i32,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        Ok(sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT AVG(r.temperature)
              FROM sensor_reading r
              JOIN iot_device d ON d.device_id = r.device_id
             WHERE d.enclosure_id = $1
               AND r.recorded_at >= $2
            "#,
        )
        .bind(enclosure_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn climate_band(&self, enclosure_id: i32) -> Result<Option<ClimateBand>> {
        Ok(sqlx::query_as::<_, ClimateBand>(
            r#"
            SELECT cp.min_temperature, cp.max_temperature
              FROM climate_profile cp
             WHERE cp.species_id = (
                   SELECT a.species_id
                     FROM animal a
                    WHERE a.enclosure_id = $1
                    ORDER BY a.animal_id
                    LIMIT 1)
             ORDER BY cp.profile_id
             LIMIT 1
            "#,
        )
        .bind(enclosure_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn feeding_schedules(&self, enclosure_id: i32) -> Result<Vec<FeedingSchedule>> {
        Ok(sqlx::query_as::<_, FeedingSchedule>(
            r#"
            SELECT schedule_id, enclosure_id, feed_time, portion_size, food_type, days_of_week
              FROM feeding_schedule
             WHERE enclosure_id = $1
             ORDER BY feed_time, schedule_id
            "#,
        )
        .bind(enclosure_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn resolve_alert(&self, alert_id: i64) -> Result<Alert> {
        let query = format!("UPDATE alert SET status = $2 WHERE alert_id = $1 RETURNING {ALERT_COLUMNS}");
        sqlx::query_as::<_, Alert>(&query)
            .bind(alert_id)
            .bind(AlertStatus::Resolved.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Alert {alert_id} not found")))
    }

    async fn open_alerts(&self) -> Result<Vec<Alert>> {
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM alert WHERE status = $1 \
             ORDER BY created_at DESC, alert_id DESC"
        );
        Ok(sqlx::query_as::<_, Alert>(&query)
            .bind(AlertStatus::New.as_str())
            .fetch_all(&self.pool)
            .await?)
    }

    async fn alert_history(&self, enclosure_id: Option<i32>, limit: i64) -> Result<Vec<Alert>> {
        let query = format!(
            "SELECT {ALERT_COLUMNS} FROM alert \
             WHERE ($1::integer IS NULL OR enclosure_id = $1) \
             ORDER BY created_at DESC, alert_id DESC \
             LIMIT $2"
        );
        Ok(sqlx::query_as::<_, Alert>(&query)
            .bind(enclosure_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
