use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::Result;
use crate::metrics::ALERTS_RAISED_TOTAL;
use crate::model::{Alert, ClimateBand, NewAlert, NewReading};
use crate::store::{AlertCandidate, DedupPolicy, RecordedReading, Store};

pub const CLIMATE_ALERT: &str = "Climate";
pub const CRITICAL_HIGH_ALERT: &str = "Critical High Temp";
pub const CRITICAL_LOW_ALERT: &str = "Critical Low Temp";
pub const SYSTEM_ALERT: &str = "System";

/// How a temperature is compared against the climate band
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvaluationMode {
    /// Raw band; one open `Climate` alert per enclosure at a time.
    Threshold,
    /// Band widened by `margin`; a same-type open alert younger than
    /// `dedup_window` suppresses a new one.
    Margin { margin: f64, dedup_window: Duration },
}

impl EvaluationMode {
    fn dedup_policy(&self) -> DedupPolicy {
        match self {
            EvaluationMode::Threshold => DedupPolicy::OpenOfType,
            EvaluationMode::Margin { dedup_window, .. } => DedupPolicy::RecentOpen {
                window: *dedup_window,
            },
        }
    }
}

/// Type and message of a band violation
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub alert_type: &'static str,
    pub message: String,
}

/// Checks `temperature` against `band`. Pure.
pub fn classify(temperature: f64, band: ClimateBand, mode: EvaluationMode) -> Option<Violation> {
    let ClimateBand {
        min_temperature: min,
        max_temperature: max,
    } = band;

    match mode {
        EvaluationMode::Threshold => {
            if temperature > max {
                Some(Violation {
                    alert_type: CLIMATE_ALERT,
                    message: format!("TEMP HIGH: {temperature:.1}°C"),
                })
            } else if temperature < min {
                Some(Violation {
                    alert_type: CLIMATE_ALERT,
                    message: format!("TEMP LOW: {temperature:.1}°C"),
                })
            } else {
                None
            }
        }
        EvaluationMode::Margin { margin, .. } => {
            if temperature < min - margin {
                Some(Violation {
                    alert_type: CRITICAL_LOW_ALERT,
                    message: format!(
                        "Temperature {temperature:.1}°C is {:.1}°C below normal (Min: {min:.1}°C)",
                        min - temperature
                    ),
                })
            } else if temperature > max + margin {
                Some(Violation {
                    alert_type: CRITICAL_HIGH_ALERT,
                    message: format!(
                        "Temperature {temperature:.1}°C is {:.1}°C above normal (Max: {max:.1}°C)",
                        temperature - max
                    ),
                })
            } else {
                None
            }
        }
    }
}

/// Connectivity alert for a device that stopped reporting
pub fn lost_connection_alert(enclosure_id: i32, mac_address: &str, now: DateTime<Utc>) -> NewAlert {
    NewAlert {
        enclosure_id,
        alert_type: SYSTEM_ALERT.to_string(),
        message: format!("Device {mac_address} lost connection"),
        created_at: now,
    }
}

/// Raises, lists and resolves enclosure alerts
#[derive(Clone)]
pub struct AlertEngine {
    store: Arc<dyn Store>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Stores `reading` and, when the device sits in an enclosure whose band
    /// it violates, an alert in the same write. A missing band or a
    /// suppressed duplicate leaves `alert` empty.
    pub async fn record_reading(
        &self,
        reading: NewReading,
        enclosure_id: Option<i32>,
        mode: EvaluationMode,
    ) -> Result<RecordedReading> {
        let candidate = match enclosure_id {
            Some(enclosure_id) => {
                self.candidate(enclosure_id, reading.temperature, mode, reading.recorded_at)
                    .await?
            }
            None => None,
        };
        let checked = candidate.is_some();

        let recorded = self.store.record_reading(reading, candidate).await?;
        match &recorded.alert {
            Some(alert) => {
                ALERTS_RAISED_TOTAL
                    .with_label_values(&[alert.alert_type.as_str()])
                    .inc();
                info!(
                    alert_id = alert.alert_id,
                    enclosure_id = alert.enclosure_id,
                    alert_type = %alert.alert_type,
                    "🚨 {}",
                    alert.message
                );
            }
            None if checked => debug!(?enclosure_id, "Open alert already covers this condition"),
            None => {}
        }
        Ok(recorded)
    }

    async fn candidate(
        &self,
        enclosure_id: i32,
        temperature: f64,
        mode: EvaluationMode,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertCandidate>> {
        let Some(band) = self.store.climate_band(enclosure_id).await? else {
            debug!(enclosure_id, "No climate profile resolvable; skipping alert check");
            return Ok(None);
        };

        Ok(classify(temperature, band, mode).map(|violation| AlertCandidate {
            alert: NewAlert {
                enclosure_id,
                alert_type: violation.alert_type.to_string(),
                message: violation.message,
                created_at: now,
            },
            policy: mode.dedup_policy(),
        }))
    }

    pub async fn resolve(&self, alert_id: i64) -> Result<Alert> {
        let alert = self.store.resolve_alert(alert_id).await?;
        info!(alert_id, enclosure_id = alert.enclosure_id, "Alert resolved");
        Ok(alert)
    }

    pub async fn open_alerts(&self) -> Result<Vec<Alert>> {
        self.store.open_alerts().await
    }

    pub async fn history(&self, enclosure_id: Option<i32>, limit: i64) -> Result<Vec<Alert>> {
        self.store.alert_history(enclosure_id, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::{AlertStatus, NewDevice};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use tokio::task::JoinSet;

    const BAND: ClimateBand = ClimateBand {
        min_temperature: 18.0,
        max_temperature: 24.0,
    };

    fn margin() -> EvaluationMode {
        EvaluationMode::Margin {
            margin: 5.0,
            dedup_window: Duration::minutes(10),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn engine_over(store: &MemoryStore) -> AlertEngine {
        store
            .register_device(NewDevice {
                mac_address: "AA:BB:CC:00:00:07".to_string(),
                enclosure_id: Some(7),
                firmware_version: None,
                status: None,
            })
            .await
            .unwrap();
        AlertEngine::new(Arc::new(store.clone()))
    }

    async fn engine_with_band() -> (AlertEngine, MemoryStore) {
        let store = MemoryStore::new();
        store.add_animal(7, 1).await;
        store.add_climate_profile(1, 18.0, 24.0).await;
        (engine_over(&store).await, store)
    }

    async fn check(
        engine: &AlertEngine,
        temperature: f64,
        mode: EvaluationMode,
        at: DateTime<Utc>,
    ) -> Option<Alert> {
        let reading = NewReading {
            device_id: 1,
            temperature,
            humidity: 50.0,
            light: None,
            recorded_at: at,
        };
        engine
            .record_reading(reading, Some(7), mode)
            .await
            .unwrap()
            .alert
    }

    #[test]
    fn test_threshold_classification() {
        let high = classify(26.0, BAND, EvaluationMode::Threshold).unwrap();
        assert_eq!(high.alert_type, CLIMATE_ALERT);
        assert_eq!(high.message, "TEMP HIGH: 26.0°C");

        let low = classify(17.5, BAND, EvaluationMode::Threshold).unwrap();
        assert_eq!(low.message, "TEMP LOW: 17.5°C");

        assert!(classify(24.0, BAND, EvaluationMode::Threshold).is_none());
        assert!(classify(18.0, BAND, EvaluationMode::Threshold).is_none());
    }

    #[test]
    fn test_margin_classification() {
        assert!(classify(29.0, BAND, margin()).is_none());
        assert!(classify(13.0, BAND, margin()).is_none());

        let high = classify(31.0, BAND, margin()).unwrap();
        assert_eq!(high.alert_type, CRITICAL_HIGH_ALERT);
        assert!(high.message.contains("7.0°C above normal"));

        let low = classify(12.5, BAND, margin()).unwrap();
        assert_eq!(low.alert_type, CRITICAL_LOW_ALERT);
        assert!(low.message.contains("5.5°C below normal"));
    }

    #[tokio::test]
    async fn no_band_means_no_alert() {
        let store = MemoryStore::new();
        let engine = engine_over(&store).await;
        let alert = check(&engine, 99.0, EvaluationMode::Threshold, t0()).await;
        assert!(alert.is_none());
        assert!(store.alerts().await.is_empty());
        assert_eq!(store.readings().await.len(), 1);
    }

    #[tokio::test]
    async fn unassigned_device_is_not_checked() {
        let (engine, store) = engine_with_band().await;
        let reading = NewReading {
            device_id: 1,
            temperature: 99.0,
            humidity: 50.0,
            light: None,
            recorded_at: t0(),
        };
        let recorded = engine
            .record_reading(reading, None, EvaluationMode::Threshold)
            .await
            .unwrap();
        assert!(recorded.alert.is_none());
        assert!(store.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn threshold_dedup_until_resolved() {
        let (engine, store) = engine_with_band().await;

        let first = check(&engine, 26.0, EvaluationMode::Threshold, t0())
            .await
            .unwrap();
        let second = check(
            &engine,
            16.0,
            EvaluationMode::Threshold,
            t0() + Duration::hours(3),
        )
        .await;
        assert!(second.is_none());
        assert_eq!(store.alerts().await.len(), 1);

        engine.resolve(first.alert_id).await.unwrap();
        let third = check(
            &engine,
            27.0,
            EvaluationMode::Threshold,
            t0() + Duration::hours(4),
        )
        .await;
        assert!(third.is_some());
        assert_eq!(store.alerts().await.len(), 2);
    }

    #[tokio::test]
    async fn margin_dedup_window() {
        let (engine, store) = engine_with_band().await;

        assert!(check(&engine, 31.0, margin(), t0()).await.is_some());
        assert!(check(&engine, 32.0, margin(), t0() + Duration::minutes(9))
            .await
            .is_none());
        assert!(check(&engine, 32.0, margin(), t0() + Duration::minutes(11))
            .await
            .is_some());
        assert!(check(&engine, 10.0, margin(), t0() + Duration::minutes(12))
            .await
            .is_some());
        assert_eq!(store.alerts().await.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_evaluations_raise_one_alert() {
        let (engine, store) = engine_with_band().await;

        let mut tasks = JoinSet::new();
        for i in 0..20 {
            let engine = engine.clone();
            tasks.spawn(async move {
                check(&engine, 30.0, margin(), t0() + Duration::seconds(i)).await
            });
        }

        let mut raised = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap().is_some() {
                raised += 1;
            }
        }

        assert_eq!(raised, 1);
        assert_eq!(store.alerts().await.len(), 1);
        assert_eq!(store.readings().await.len(), 20);
    }

    #[tokio::test]
    async fn resolve_unknown_alert_is_not_found() {
        let (engine, _) = engine_with_band().await;
        let err = engine.resolve(404).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_is_one_way_and_listed_in_history() {
        let (engine, _) = engine_with_band().await;
        let alert = check(&engine, 30.0, EvaluationMode::Threshold, t0())
            .await
            .unwrap();

        let resolved = engine.resolve(alert.alert_id).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        let again = engine.resolve(alert.alert_id).await.unwrap();
        assert_eq!(again.status, AlertStatus::Resolved);

        assert!(engine.open_alerts().await.unwrap().is_empty());
        let history = engine.history(Some(7), 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(engine.history(Some(8), 50).await.unwrap().is_empty());
    }
}
