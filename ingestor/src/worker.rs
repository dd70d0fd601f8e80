use crate::errors::Error;
use crate::model::BusTelemetry;
use crate::service::TelemetryService;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Drains bus telemetry from `rx` and runs the retention sweep on a timer.
///
/// Each message is handled on its own task so a slow database round-trip
/// does not hold up the subscriber. Returns once the channel is closed and
/// all in-flight messages are done.
pub async fn run_worker(
    mut rx: mpsc::Receiver<BusTelemetry>,
    service: TelemetryService,
    retention_sweep_secs: u64,
) {
    info!(
        "Starting worker with retention_sweep_secs={}",
        retention_sweep_secs
    );

    let mut in_flight = JoinSet::new();
    let mut ticker = interval(Duration::from_secs(retention_sweep_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(payload) => {
                        let service = service.clone();
                        in_flight.spawn(async move {
                            handle_message(&service, payload).await;
                        });
                    }
                    None => {
                        info!("Channel closed, waiting for in-flight messages");
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = service.prune(Utc::now()).await {
                    error!("Retention sweep failed: {}", e);
                }
            }

            // Reap finished tasks so the set does not grow unbounded.
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Message task panicked: {}", e);
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!("Message task panicked: {}", e);
        }
    }
    info!("Worker stopped");
}

async fn handle_message(service: &TelemetryService, payload: BusTelemetry) {
    match service.ingest_bus(&payload, Utc::now()).await {
        Ok(outcome) => {
            for alert in &outcome.alerts_raised {
                warn!("Alert raised from bus reading: {}", alert);
            }
        }
        Err(Error::DeviceUnknown(device)) => {
            warn!("Dropping reading for unregistered {}", device);
        }
        Err(Error::Validation(reason)) => {
            warn!("Dropping malformed bus reading: {}", reason);
        }
        Err(e) => error!("Failed to process bus reading: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineSettings;
    use crate::model::NewDevice;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    #[test]
    fn test_worker_drains_channel_then_stops() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store
                .register_device(NewDevice {
                    mac_address: "AV:01".to_string(),
                    enclosure_id: Some(1),
                    firmware_version: None,
                    status: None,
                })
                .await
                .unwrap();
            let service = TelemetryService::new(Arc::new(store.clone()), PipelineSettings::default());

            let (tx, rx) = mpsc::channel(10);
            tx.send(BusTelemetry {
                aviary_id: Some(serde_json::json!("AV_001")),
                temp: Some(serde_json::json!(22.5)),
                hum: Some(serde_json::json!(55.0)),
                ..Default::default()
            })
            .await
            .unwrap();
            tx.send(BusTelemetry {
                aviary_id: Some(serde_json::json!("AV_009")),
                temp: Some(serde_json::json!("22.5")),
                ..Default::default()
            })
            .await
            .unwrap();
            tx.send(BusTelemetry {
                aviary_id: Some(serde_json::json!("AV_001")),
                temp: Some(serde_json::json!("warm")),
                ..Default::default()
            })
            .await
            .unwrap();
            drop(tx);

            run_worker(rx, service, 3600).await;

            let readings = store.readings().await;
            assert_eq!(readings.len(), 1);
            assert_eq!(readings[0].device_id, 1);
            assert_eq!(readings[0].temperature, 22.5);
        });
    }
}
