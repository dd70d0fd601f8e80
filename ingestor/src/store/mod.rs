//! Persistence for devices, readings and alerts.
//!
//! Enclosures, animals, species, climate profiles and feeding schedules are
//! owned by the staff-facing CRUD service; this layer only reads them.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::errors::Result;
use crate::model::{
    Alert, ClimateBand, Device, FeedingSchedule, NewAlert, NewDevice, NewReading, Reading,
};

/// How an alert insert is suppressed when a similar alert is still open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Skip if any open alert with the same enclosure and type exists.
    OpenOfType,
    /// Skip if the newest open alert of the enclosure has the same type and
    /// is younger than `window`.
    RecentOpen { window: Duration },
    /// Always insert.
    None,
}

impl DedupPolicy {
    /// Decides suppression given the open alerts of the enclosure, newest
    /// first.
    pub fn suppresses(&self, candidate: &NewAlert, open_newest_first: &[Alert]) -> bool {
        match self {
            DedupPolicy::OpenOfType => open_newest_first
                .iter()
                .any(|a| a.alert_type == candidate.alert_type),
            DedupPolicy::RecentOpen { window } => match open_newest_first.first() {
                Some(latest) => {
                    latest.alert_type == candidate.alert_type
                        && candidate.created_at - latest.created_at < *window
                }
                None => false,
            },
            DedupPolicy::None => false,
        }
    }
}

/// Alert written together with a reading, subject to `policy`
#[derive(Debug, Clone)]
pub struct AlertCandidate {
    pub alert: NewAlert,
    pub policy: DedupPolicy,
}

/// What `Store::record_reading` committed
#[derive(Debug, Clone)]
pub struct RecordedReading {
    pub reading: Reading,
    /// `None` when no candidate was given or the policy suppressed it.
    pub alert: Option<Alert>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn register_device(&self, device: NewDevice) -> Result<Device>;

    async fn device_by_mac(&self, mac_address: &str) -> Result<Option<Device>>;

    async fn device_by_id(&self, device_id: i32) -> Result<Option<Device>>;

    /// Devices whose last contact is older than `cutoff`. Devices that
    /// never reported are not listed.
    async fn stale_devices(&self, cutoff: DateTime<Utc>) -> Result<Vec<Device>>;

    /// Flips a device to Offline if it is still stale at `cutoff` and not
    /// already Offline, inserting `alert` (never deduplicated) in the same
    /// unit. Returns whether the row changed; on error nothing is kept.
    async fn mark_offline(
        &self,
        device_id: i32,
        cutoff: DateTime<Utc>,
        alert: Option<NewAlert>,
    ) -> Result<bool>;

    /// Writes the reading, marks its device Online with the reading time
    /// unless a later last-seen is stored, and inserts `alert` unless its
    /// policy suppresses it. All or nothing; the duplicate check is atomic
    /// with respect to other calls on the same enclosure.
    async fn record_reading(
        &self,
        reading: NewReading,
        alert: Option<AlertCandidate>,
    ) -> Result<RecordedReading>;

    /// Deletes readings strictly older than `cutoff`.
    async fn prune_readings(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn latest_reading(&self, enclosure_id: i32) -> Result<Option<Reading>>;

    async fn reading_history(
        &self,
        enclosure_id: i32,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Reading>>;

    async fn average_temperature(
        &self,
        enclosure_id: i32,
        since: DateTime<Utc>,
    ) -> Result<Option<f64>>;

    /// Band of the first animal's species in the enclosure, first profile.
    async fn climate_band(&self, enclosure_id: i32) -> Result<Option<ClimateBand>>;

    async fn feeding_schedules(&self, enclosure_id: i32) -> Result<Vec<FeedingSchedule>>;

    async fn resolve_alert(&self, alert_id: i64) -> Result<Alert>;

    async fn open_alerts(&self) -> Result<Vec<Alert>>;

    async fn alert_history(&self, enclosure_id: Option<i32>, limit: i64) -> Result<Vec<Alert>>;

    async fn ping(&self) -> Result<()>;
}
