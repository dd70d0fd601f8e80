use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::time;
use tracing::{error, info, warn};

use crate::alerts::{lost_connection_alert, SYSTEM_ALERT};
use crate::errors::Result;
use crate::metrics::ALERTS_RAISED_TOTAL;
use crate::model::{DeviceStatus, HealthReport};
use crate::store::Store;

/// Sweeps devices that went silent and flags them Offline
#[derive(Clone)]
pub struct HealthMonitor {
    store: Arc<dyn Store>,
    offline_after: Duration,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Store>, offline_after: Duration) -> Self {
        Self {
            store,
            offline_after,
        }
    }

    /// Marks every device silent for longer than the offline threshold as
    /// Offline and raises a `System` alert for each one that just
    /// transitioned. The flip and its alert are written together, so a
    /// failed alert leaves the device to the next sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let cutoff = now - self.offline_after;
        let stale = self.store.stale_devices(cutoff).await?;

        let mut newly_offline = 0;
        for device in &stale {
            if device.status == DeviceStatus::Offline {
                continue;
            }
            let alert = device
                .enclosure_id
                .map(|enclosure_id| lost_connection_alert(enclosure_id, &device.mac_address, now));
            let alerted = alert.is_some();
            if !self
                .store
                .mark_offline(device.device_id, cutoff, alert)
                .await?
            {
                // Reported again since the listing.
                continue;
            }
            newly_offline += 1;
            if alerted {
                ALERTS_RAISED_TOTAL.with_label_values(&[SYSTEM_ALERT]).inc();
            }
            warn!(
                device_id = device.device_id,
                mac = %device.mac_address,
                last_seen = ?device.last_seen,
                "Device went offline"
            );
        }

        let db_connection = match self.store.ping().await {
            Ok(()) => "OK",
            Err(e) => {
                error!("Storage ping failed: {}", e);
                "ERROR"
            }
        };

        Ok(HealthReport {
            status: "System Operational".to_string(),
            offline_devices_detected: stale.len(),
            newly_offline,
            db_connection: db_connection.to_string(),
        })
    }

    /// Runs the sweep on a fixed interval. Spawn via `tokio::spawn`.
    pub async fn run(self, interval_secs: u64) {
        info!(interval_secs, "Health-check sweep started");
        let mut ticker = time::interval(std::time::Duration::from_secs(interval_secs.max(1)));

        loop {
            ticker.tick().await;
            match self.sweep(Utc::now()).await {
                Ok(report) if report.newly_offline > 0 => info!(
                    newly_offline = report.newly_offline,
                    stale = report.offline_devices_detected,
                    "Health-check sweep completed"
                ),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Health-check sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::NewDevice;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn device(store: &MemoryStore, mac: &str, enclosure_id: Option<i32>) -> i32 {
        store
            .register_device(NewDevice {
                mac_address: mac.to_string(),
                enclosure_id,
                firmware_version: None,
                status: None,
            })
            .await
            .unwrap()
            .device_id
    }

    #[tokio::test]
    async fn silent_device_goes_offline_once() {
        let store = MemoryStore::new();
        let monitor = HealthMonitor::new(Arc::new(store.clone()), Duration::minutes(30));

        let quiet = device(&store, "AA:00", Some(1)).await;
        let chatty = device(&store, "AA:01", Some(2)).await;
        store.touch_device(quiet, t0()).await;
        store.touch_device(chatty, t0() + Duration::minutes(25)).await;

        let now = t0() + Duration::minutes(31);
        let report = monitor.sweep(now).await.unwrap();
        assert_eq!(report.offline_devices_detected, 1);
        assert_eq!(report.newly_offline, 1);
        assert_eq!(report.db_connection, "OK");

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, SYSTEM_ALERT);
        assert_eq!(alerts[0].enclosure_id, 1);
        assert_eq!(alerts[0].message, "Device AA:00 lost connection");

        let second = monitor.sweep(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(second.offline_devices_detected, 1);
        assert_eq!(second.newly_offline, 0);
        assert_eq!(store.alerts().await.len(), 1);

        let status = store.device_by_id(quiet).await.unwrap().unwrap().status;
        assert_eq!(status, DeviceStatus::Offline);
    }

    #[tokio::test]
    async fn unassigned_device_goes_offline_without_alert() {
        let store = MemoryStore::new();
        let monitor = HealthMonitor::new(Arc::new(store.clone()), Duration::minutes(30));

        let id = device(&store, "AA:02", None).await;
        store.touch_device(id, t0()).await;

        let report = monitor.sweep(t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(report.newly_offline, 1);
        assert!(store.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn failed_alert_keeps_device_for_next_sweep() {
        let store = MemoryStore::new();
        let monitor = HealthMonitor::new(Arc::new(store.clone()), Duration::minutes(30));
        let id = device(&store, "AA:04", Some(4)).await;
        store.touch_device(id, t0()).await;
        let now = t0() + Duration::hours(1);

        store.fail_alert_writes(true);
        let err = monitor.sweep(now).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        let status = store.device_by_id(id).await.unwrap().unwrap().status;
        assert_eq!(status, DeviceStatus::Online);

        store.fail_alert_writes(false);
        let report = monitor.sweep(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(report.newly_offline, 1);
        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, SYSTEM_ALERT);
        assert_eq!(alerts[0].message, "Device AA:04 lost connection");
    }

    #[tokio::test]
    async fn never_seen_device_is_ignored() {
        let store = MemoryStore::new();
        let monitor = HealthMonitor::new(Arc::new(store.clone()), Duration::minutes(30));
        device(&store, "AA:03", Some(3)).await;

        let report = monitor.sweep(t0()).await.unwrap();
        assert_eq!(report.offline_devices_detected, 0);
    }
}
