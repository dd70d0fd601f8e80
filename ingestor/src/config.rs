use chrono::Duration;
use std::env;
use std::str::FromStr;

use crate::errors::{Error, Result};

/// Runtime settings, read once from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL. Without it the service keeps everything in memory.
    pub database_url: Option<String>,
    pub db_pool_max: u32,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_topic: String,
    pub http_addr: String,
    pub channel_capacity: usize,
    pub pipeline: PipelineSettings,
    pub health_check_interval_secs: u64,
    pub retention_sweep_interval_secs: u64,
}

/// Policy knobs of the ingestion and alerting pipeline
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Minimum gap between persisted bus readings of one device.
    pub save_interval: Duration,
    /// Readings older than this are pruned.
    pub retention: Duration,
    /// Widening of the climate band before a bus reading raises an alert.
    pub alert_margin: f64,
    /// Same-type open alerts younger than this suppress a new bus alert.
    pub alert_dedup_window: Duration,
    /// Silence after which the health sweep marks a device Offline.
    pub offline_after: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            save_interval: Duration::seconds(180),
            retention: Duration::hours(24),
            alert_margin: 5.0,
            alert_dedup_window: Duration::minutes(10),
            offline_after: Duration::minutes(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = PipelineSettings::default();

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            db_pool_max: parse_or("DB_POOL_MAX", 20)?,
            mqtt_broker: env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: parse_or("MQTT_PORT", 1883)?,
            mqtt_topic: env::var("MQTT_TOPIC").unwrap_or_else(|_| "zoo/telemetry".to_string()),
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            channel_capacity: parse_or("CHANNEL_CAPACITY", 10_000)?,
            pipeline: PipelineSettings {
                save_interval: Duration::seconds(parse_or(
                    "SAVE_INTERVAL_SECS",
                    defaults.save_interval.num_seconds(),
                )?),
                retention: Duration::hours(parse_or(
                    "RETENTION_HOURS",
                    defaults.retention.num_hours(),
                )?),
                alert_margin: parse_or("ALERT_MARGIN", defaults.alert_margin)?,
                alert_dedup_window: Duration::seconds(parse_or(
                    "ALERT_DEDUP_WINDOW_SECS",
                    defaults.alert_dedup_window.num_seconds(),
                )?),
                offline_after: Duration::seconds(parse_or(
                    "OFFLINE_AFTER_SECS",
                    defaults.offline_after.num_seconds(),
                )?),
            },
            health_check_interval_secs: parse_or("HEALTH_CHECK_INTERVAL_SECS", 300)?,
            retention_sweep_interval_secs: parse_or("RETENTION_SWEEP_INTERVAL_SECS", 3600)?,
        })
    }

    /// Database URL with the password masked, for logging
    pub fn masked_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url
                .split('@')
                .last()
                .map(|host| format!("***@{host}"))
                .unwrap_or_else(|| "***".to_string()),
            None => "in-memory".to_string(),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Validation(format!("{key} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.save_interval.num_seconds(), 180);
        assert_eq!(settings.retention.num_hours(), 24);
        assert_eq!(settings.alert_margin, 5.0);
        assert_eq!(settings.alert_dedup_window.num_minutes(), 10);
        assert_eq!(settings.offline_after.num_minutes(), 30);
    }

    #[test]
    fn test_parse_or_default_when_unset() {
        let value: u64 = parse_or("ZOOCARE_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_masked_database_url() {
        let mut config = Config::from_env().unwrap();
        config.database_url = Some("postgres://iot:secret@db:5432/zoo".to_string());
        assert_eq!(config.masked_database_url(), "***@db:5432/zoo");
        config.database_url = None;
        assert_eq!(config.masked_database_url(), "in-memory");
    }
}
