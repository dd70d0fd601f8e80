use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{AlertEngine, EvaluationMode};
use crate::config::PipelineSettings;
use crate::errors::{Error, Result};
use crate::metrics::{
    INGEST_LATENCY_SECONDS, READINGS_PERSISTED_TOTAL, READINGS_PRUNED_TOTAL, THROTTLED_TOTAL,
};
use crate::model::{
    BusTelemetry, IngestOutcome, IngestRequest, NewReading, Reading, TemperatureAverage,
};
use crate::store::Store;
use crate::throttle::Throttle;
use crate::validate::{validate, validate_bus, BusSample};

/// Default number of rows returned by the reading history
pub const DEFAULT_HISTORY_LIMIT: i64 = 100;

/// Entry point for readings arriving over HTTP or the message bus
#[derive(Clone)]
pub struct TelemetryService {
    store: Arc<dyn Store>,
    alerts: AlertEngine,
    throttle: Arc<Throttle>,
    settings: PipelineSettings,
}

impl TelemetryService {
    pub fn new(store: Arc<dyn Store>, settings: PipelineSettings) -> Self {
        Self {
            alerts: AlertEngine::new(store.clone()),
            throttle: Arc::new(Throttle::new(settings.save_interval)),
            store,
            settings,
        }
    }

    pub fn alerts(&self) -> &AlertEngine {
        &self.alerts
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Synchronous path: always records the reading and refreshes the
    /// device, checking the raw climate band in the same write.
    pub async fn ingest_reading(
        &self,
        request: IngestRequest,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        validate(&request)?;
        let started = Instant::now();

        let device = self
            .store
            .device_by_mac(&request.mac_address)
            .await?
            .ok_or_else(|| Error::DeviceUnknown(request.mac_address.clone()))?;

        let recorded = self
            .alerts
            .record_reading(
                NewReading {
                    device_id: device.device_id,
                    temperature: request.temperature,
                    humidity: request.humidity,
                    light: request.light,
                    recorded_at: now,
                },
                device.enclosure_id,
                EvaluationMode::Threshold,
            )
            .await?;
        READINGS_PERSISTED_TOTAL.inc();
        let alerts_raised = recorded.alert.into_iter().map(|a| a.message).collect();

        INGEST_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        debug!(
            device_id = device.device_id,
            temperature = request.temperature,
            "Reading recorded"
        );

        Ok(IngestOutcome {
            accepted: true,
            alerts_raised,
        })
    }

    /// Message-bus path: persists at most one reading per device per save
    /// interval, prunes expired readings, then checks the widened band.
    ///
    /// A throttled message returns `accepted: false` without touching
    /// storage. A failed write keeps nothing, so the save slot is handed
    /// back for the next message.
    pub async fn ingest_bus(
        &self,
        payload: &BusTelemetry,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let sample = validate_bus(payload)?;

        let Some(permit) = self.throttle.try_acquire(sample.device_id, now) else {
            THROTTLED_TOTAL.inc();
            debug!(device_id = sample.device_id, "Save interval not elapsed; skipping");
            return Ok(IngestOutcome::default());
        };

        match self.persist_bus_sample(sample, now).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.throttle.release(permit);
                Err(e)
            }
        }
    }

    async fn persist_bus_sample(
        &self,
        sample: BusSample,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let started = Instant::now();

        let device = self
            .store
            .device_by_id(sample.device_id)
            .await?
            .ok_or_else(|| Error::DeviceUnknown(format!("device {}", sample.device_id)))?;

        self.prune(now).await?;

        let mode = EvaluationMode::Margin {
            margin: self.settings.alert_margin,
            dedup_window: self.settings.alert_dedup_window,
        };
        let recorded = self
            .alerts
            .record_reading(
                NewReading {
                    device_id: device.device_id,
                    temperature: sample.temperature,
                    humidity: sample.humidity,
                    light: Some(0.0),
                    recorded_at: now,
                },
                device.enclosure_id,
                mode,
            )
            .await?;
        READINGS_PERSISTED_TOTAL.inc();
        let alerts_raised = recorded.alert.into_iter().map(|a| a.message).collect();

        INGEST_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        info!(
            device_id = device.device_id,
            temperature = sample.temperature,
            next_save_in_secs = self.settings.save_interval.num_seconds(),
            "💾 Reading saved"
        );

        Ok(IngestOutcome {
            accepted: true,
            alerts_raised,
        })
    }

    /// Deletes readings older than the retention window.
    pub async fn prune(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.settings.retention;
        let removed = self.store.prune_readings(cutoff).await?;
        if removed > 0 {
            READINGS_PRUNED_TOTAL.inc_by(removed as f64);
            info!(
                removed,
                retention_hours = self.settings.retention.num_hours(),
                "🧹 Pruned expired readings"
            );
        }
        Ok(removed)
    }

    pub async fn latest_reading(&self, enclosure_id: i32) -> Result<Option<Reading>> {
        self.store.latest_reading(enclosure_id).await
    }

    pub async fn reading_history(
        &self,
        enclosure_id: i32,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<Reading>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);
        self.store
            .reading_history(enclosure_id, start, end, limit)
            .await
    }

    /// Mean temperature of the enclosure over the last 24 hours, 0.0 when
    /// nothing was recorded.
    pub async fn average_temperature(
        &self,
        enclosure_id: i32,
        now: DateTime<Utc>,
    ) -> Result<TemperatureAverage> {
        let since = now - chrono::Duration::hours(24);
        let avg = self.store.average_temperature(enclosure_id, since).await?;
        if avg.is_none() {
            warn!(enclosure_id, "No readings in the last 24h");
        }
        Ok(TemperatureAverage {
            enclosure_id,
            avg_temp_24h: avg.unwrap_or(0.0),
        })
    }
}
