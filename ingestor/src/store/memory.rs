use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{AlertCandidate, RecordedReading, Store};
use crate::errors::{Error, Result};
use crate::model::{
    Alert, AlertStatus, ClimateBand, Device, DeviceStatus, FeedingSchedule, NewAlert, NewDevice,
    NewReading, Reading,
};

#[derive(Debug, Clone)]
struct AnimalRecord {
    animal_id: i32,
    enclosure_id: i32,
    species_id: i32,
}

#[derive(Debug, Clone)]
struct ProfileRecord {
    profile_id: i32,
    species_id: i32,
    band: ClimateBand,
}

#[derive(Debug, Default)]
struct Tables {
    devices: Vec<Device>,
    readings: Vec<Reading>,
    alerts: Vec<Alert>,
    animals: Vec<AnimalRecord>,
    profiles: Vec<ProfileRecord>,
    schedules: Vec<FeedingSchedule>,
    next_device_id: i32,
    next_reading_id: i64,
    next_alert_id: i64,
    next_record_id: i32,
}

impl Tables {
    fn next_record_id(&mut self) -> i32 {
        self.next_record_id += 1;
        self.next_record_id
    }

    fn device_enclosure(&self, device_id: i32) -> Option<i32> {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .and_then(|d| d.enclosure_id)
    }

    fn enclosure_readings(&self, enclosure_id: i32) -> Vec<Reading> {
        let mut rows: Vec<Reading> = self
            .readings
            .iter()
            .filter(|r| self.device_enclosure(r.device_id) == Some(enclosure_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.recorded_at
                .cmp(&a.recorded_at)
                .then(b.reading_id.cmp(&a.reading_id))
        });
        rows
    }

    fn open_alerts_of(&self, enclosure_id: i32) -> Vec<Alert> {
        let mut open: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| a.enclosure_id == enclosure_id && a.status == AlertStatus::New)
            .cloned()
            .collect();
        newest_first(&mut open);
        open
    }

    fn push_alert(&mut self, alert: NewAlert) -> Alert {
        self.next_alert_id += 1;
        let row = Alert {
            alert_id: self.next_alert_id,
            enclosure_id: alert.enclosure_id,
            alert_type: alert.alert_type,
            message: alert.message,
            status: AlertStatus::New,
            created_at: alert.created_at,
        };
        self.alerts.push(row.clone());
        row
    }

    /// Compare-and-set on last-seen.
    fn touch(&mut self, device_id: i32, seen_at: DateTime<Utc>) -> bool {
        let Some(device) = self.devices.iter_mut().find(|d| d.device_id == device_id) else {
            return false;
        };
        if device.last_seen.is_some_and(|last| last >= seen_at) {
            return false;
        }
        device.last_seen = Some(seen_at);
        device.status = DeviceStatus::Online;
        true
    }
}

fn newest_first(alerts: &mut [Alert]) {
    alerts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then(b.alert_id.cmp(&a.alert_id))
    });
}

/// Process-local store used when no database is configured, and by tests.
///
/// Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Tables>>,
    fail_alert_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places an animal of `species_id` in the enclosure.
    pub async fn add_animal(&self, enclosure_id: i32, species_id: i32) -> i32 {
        let mut tables = self.inner.write().await;
        let animal_id = tables.next_record_id();
        tables.animals.push(AnimalRecord {
            animal_id,
            enclosure_id,
            species_id,
        });
        animal_id
    }

    pub async fn add_climate_profile(
        &self,
        species_id: i32,
        min_temperature: f64,
        max_temperature: f64,
    ) -> i32 {
        let mut tables = self.inner.write().await;
        let profile_id = tables.next_record_id();
        tables.profiles.push(ProfileRecord {
            profile_id,
            species_id,
            band: ClimateBand {
                min_temperature,
                max_temperature,
            },
        });
        profile_id
    }

    pub async fn add_feeding_schedule(
        &self,
        enclosure_id: i32,
        feed_time: NaiveTime,
        portion_size: Option<f64>,
        food_type: Option<&str>,
    ) -> i32 {
        let mut tables = self.inner.write().await;
        let schedule_id = tables.next_record_id();
        tables.schedules.push(FeedingSchedule {
            schedule_id,
            enclosure_id,
            feed_time,
            portion_size,
            food_type: food_type.map(str::to_owned),
            days_of_week: None,
        });
        schedule_id
    }

    /// Inserts a reading with an arbitrary timestamp, bypassing the pipeline.
    pub async fn backdate_reading(&self, reading: NewReading) -> Reading {
        let mut tables = self.inner.write().await;
        push_reading(&mut tables, reading)
    }

    /// Marks the device Online at `seen_at` without recording a reading.
    pub async fn touch_device(&self, device_id: i32, seen_at: DateTime<Utc>) -> bool {
        self.inner.write().await.touch(device_id, seen_at)
    }

    /// While set, every write that would insert an alert fails with a pool
    /// timeout and leaves the tables untouched.
    pub fn fail_alert_writes(&self, fail: bool) {
        self.fail_alert_writes.store(fail, Ordering::SeqCst);
    }

    fn alert_write_guard(&self) -> Result<()> {
        if self.fail_alert_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    pub async fn readings(&self) -> Vec<Reading> {
        self.inner.read().await.readings.clone()
    }

    pub async fn alerts(&self) -> Vec<Alert> {
        self.inner.read().await.alerts.clone()
    }
}

fn push_reading(tables: &mut Tables, reading: NewReading) -> Reading {
    tables.next_reading_id += 1;
    let row = Reading {
        reading_id: tables.next_reading_id,
        device_id: reading.device_id,
        temperature: reading.temperature,
        humidity: reading.humidity,
        light: reading.light,
        recorded_at: reading.recorded_at,
    };
    tables.readings.push(row.clone());
    row
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_device(&self, device: NewDevice) -> Result<Device> {
        let mut tables = self.inner.write().await;
        if tables
            .devices
            .iter()
            .any(|d| d.mac_address == device.mac_address)
        {
            return Err(Error::Conflict(format!(
                "Device MAC already registered: {}",
                device.mac_address
            )));
        }
        if let Some(enclosure_id) = device.enclosure_id {
            if tables
                .devices
                .iter()
                .any(|d| d.enclosure_id == Some(enclosure_id))
            {
                return Err(Error::Conflict(format!(
                    "Enclosure {enclosure_id} already has a device"
                )));
            }
        }

        tables.next_device_id += 1;
        let row = Device {
            device_id: tables.next_device_id,
            mac_address: device.mac_address,
            enclosure_id: device.enclosure_id,
            firmware_version: Some(
                device
                    .firmware_version
                    .unwrap_or_else(|| "1.0.0".to_string()),
            ),
            status: device.status.unwrap_or(DeviceStatus::Offline),
            last_seen: None,
        };
        tables.devices.push(row.clone());
        Ok(row)
    }

    async fn device_by_mac(&self, mac_address: &str) -> Result<Option<Device>> {
        let tables = self.inner.read().await;
        Ok(tables
            .devices
            .iter()
            .find(|d| d.mac_address == mac_address)
            .cloned())
    }

    async fn device_by_id(&self, device_id: i32) -> Result<Option<Device>> {
        let tables = self.inner.read().await;
        Ok(tables
            .devices
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned())
    }

    async fn stale_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>> {
        let tables = self.inner.read().await;
        Ok(tables
            .devices
            .iter()
            .filter(|d| d.last_seen.is_some_and(|last| last < cutoff))
            .cloned()
            .collect())
    }

    async fn mark_offline(
        &self,
        device_id: i32,
        cutoff: DateTime<Utc>,
        alert: Option<NewAlert>,
    ) -> Result<bool> {
        let mut tables = self.inner.write().await;
        let Some(device) = tables.devices.iter().find(|d| d.device_id == device_id) else {
            return Ok(false);
        };
        let stale = device.last_seen.is_some_and(|last| last < cutoff);
        if !stale || device.status == DeviceStatus::Offline {
            return Ok(false);
        }
        if alert.is_some() {
            self.alert_write_guard()?;
        }

        if let Some(device) = tables.devices.iter_mut().find(|d| d.device_id == device_id) {
            device.status = DeviceStatus::Offline;
        }
        if let Some(alert) = alert {
            tables.push_alert(alert);
        }
        Ok(true)
    }

    async fn record_reading(
        &self,
        reading: NewReading,
        alert: Option<AlertCandidate>,
    ) -> Result<RecordedReading> {
        let mut tables = self.inner.write().await;
        if !tables.devices.iter().any(|d| d.device_id == reading.device_id) {
            return Err(Error::DeviceUnknown(format!("device {}", reading.device_id)));
        }

        let alert = match alert {
            Some(candidate) => {
                let open = tables.open_alerts_of(candidate.alert.enclosure_id);
                if candidate.policy.suppresses(&candidate.alert, &open) {
                    None
                } else {
                    self.alert_write_guard()?;
                    Some(candidate.alert)
                }
            }
            None => None,
        };

        let seen_at = reading.recorded_at;
        let device_id = reading.device_id;
        let reading = push_reading(&mut tables, reading);
        tables.touch(device_id, seen_at);
        let alert = alert.map(|a| tables.push_alert(a));

        Ok(RecordedReading { reading, alert })
    }

    async fn prune_readings(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.inner.write().await;
        let before = tables.readings.len();
        tables.readings.retain(|r| r.recorded_at >= cutoff);
        Ok((before - tables.readings.len()) as u64)
    }

    async fn latest_reading(&self, enclosure_id: i32) -> Result<Option<Reading>> {
        let tables = self.inner.read().await;
        Ok(tables.enclosure_readings(enclosure_id).into_iter().next())
    }

    async fn reading_history(
        &self,
        enclosure_id: i32,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Reading>> {
        let tables = self.inner.read().await;
        Ok(tables
            .enclosure_readings(enclosure_id)
            .into_iter()
            .filter(|r| start.map_or(true, |s| r.recorded_at >= s))
            .filter(|r| end.map_or(true, |e| r.recorded_at <= e))
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn average_temperature(
        &self,
        enclosure_id: i32,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>> {
        let tables = self.inner.read().await;
        let temps: Vec<f64> = tables
            .enclosure_readings(enclosure_id)
            .iter()
            .filter(|r| r.recorded_at >= since)
            .map(|r| r.temperature)
            .collect();
        if temps.is_empty() {
            return Ok(None);
        }
        Ok(Some(temps.iter().sum::<f64>() / temps.len() as f64))
    }

    async fn climate_band(&self, enclosure_id: i32) -> Result<Option<ClimateBand>> {
        let tables = self.inner.read().await;
        let Some(animal) = tables
            .animals
            .iter()
            .filter(|a| a.enclosure_id == enclosure_id)
            .min_by_key(|a| a.animal_id)
        else {
            return Ok(None);
        };
        Ok(tables
            .profiles
            .iter()
            .filter(|p| p.species_id == animal.species_id)
            .min_by_key(|p| p.profile_id)
            .map(|p| p.band))
    }

    async fn feeding_schedules(&self, enclosure_id: i32) -> Result<Vec<FeedingSchedule>> {
        let tables = self.inner.read().await;
        let mut rows: Vec<FeedingSchedule> = tables
            .schedules
            .iter()
            .filter(|s| s.enclosure_id == enclosure_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.feed_time, s.schedule_id));
        Ok(rows)
    }

    async fn resolve_alert(&self, alert_id: i64) -> Result<Alert> {
        let mut tables = self.inner.write().await;
        let alert = tables
            .alerts
            .iter_mut()
            .find(|a| a.alert_id == alert_id)
            .ok_or_else(|| Error::NotFound(format!("Alert {alert_id} not found")))?;
        alert.status = AlertStatus::Resolved;
        Ok(alert.clone())
    }

    async fn open_alerts(&self) -> Result<Vec<Alert>> {
        let tables = self.inner.read().await;
        let mut open: Vec<Alert> = tables
            .alerts
            .iter()
            .filter(|a| a.status == AlertStatus::New)
            .cloned()
            .collect();
        newest_first(&mut open);
        Ok(open)
    }

    async fn alert_history(&self, enclosure_id: Option<i32>, limit: i64) -> Result<Vec<Alert>> {
        let tables = self.inner.read().await;
        let mut rows: Vec<Alert> = tables
            .alerts
            .iter()
            .filter(|a| enclosure_id.map_or(true, |id| a.enclosure_id == id))
            .cloned()
            .collect();
        newest_first(&mut rows);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
