use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedingEntry {
    pub time: String,
    pub portion: Option<f64>,
    pub food_type: Option<String>,
}

/// Controller settings served by the backend config endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub target_temperature_min: f64,
    pub target_temperature_max: f64,
    #[serde(default)]
    pub feeding_schedule: Vec<FeedingEntry>,
}

/// Pulls per-device config from the backend
#[derive(Debug, Clone)]
pub struct ConfigClient {
    http: Client,
    base_url: String,
}

impl ConfigClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `Ok(None)` when the backend does not know the device (yet).
    pub async fn fetch(&self, mac_address: &str) -> Result<Option<RemoteConfig>> {
        let url = format!("{}/api/v1/config/{}", self.base_url, mac_address);
        debug!(url = %url, "Requesting device config");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("Config request failed")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let config = response
            .error_for_status()
            .context("Config endpoint returned error status")?
            .json::<RemoteConfig>()
            .await
            .context("Failed to deserialize device config")?;
        Ok(Some(config))
    }
}
