use std::sync::Arc;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::model::{DeviceConfig, FeedingEntry};
use crate::store::Store;

pub const DEFAULT_TEMP_MIN: f64 = 20.0;
pub const DEFAULT_TEMP_MAX: f64 = 25.0;

/// Answers controller config pulls
#[derive(Clone)]
pub struct ConfigSync {
    store: Arc<dyn Store>,
}

impl ConfigSync {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Climate band and feeding plan for the controller with `mac_address`.
    ///
    /// Missing climate data falls back to the default band instead of
    /// failing.
    pub async fn config_for(&self, mac_address: &str) -> Result<DeviceConfig> {
        let device = self
            .store
            .device_by_mac(mac_address)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Device {mac_address} not registered")))?;
        let enclosure_id = device
            .enclosure_id
            .ok_or_else(|| Error::NotReady(format!("Device {mac_address} has no enclosure")))?;

        let (target_temperature_min, target_temperature_max) =
            match self.store.climate_band(enclosure_id).await? {
                Some(band) => (band.min_temperature, band.max_temperature),
                None => {
                    debug!(enclosure_id, "No climate profile; serving default band");
                    (DEFAULT_TEMP_MIN, DEFAULT_TEMP_MAX)
                }
            };

        let feeding_schedule = self
            .store
            .feeding_schedules(enclosure_id)
            .await?
            .into_iter()
            .map(|s| FeedingEntry {
                time: s.feed_time.format("%H:%M").to_string(),
                portion: s.portion_size,
                food_type: s.food_type,
            })
            .collect();

        Ok(DeviceConfig {
            target_temperature_min,
            target_temperature_max,
            feeding_schedule,
        })
    }
}
