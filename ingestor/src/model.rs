use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown status value: {0:?}")]
pub struct UnknownStatus(pub String);

/// Connectivity state of a registered controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "Online",
            DeviceStatus::Offline => "Offline",
            DeviceStatus::Error => "Error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Online" => Ok(DeviceStatus::Online),
            "Offline" => Ok(DeviceStatus::Offline),
            "Error" => Ok(DeviceStatus::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, UnknownStatus> {
        value.parse()
    }
}

/// Alert lifecycle. `New` alerts are open; resolving is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertStatus {
    New,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::New => "New",
            AlertStatus::Resolved => "Resolved",
        }
    }
}

impl FromStr for AlertStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "New" => Ok(AlertStatus::New),
            "Resolved" => Ok(AlertStatus::Resolved),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl TryFrom<String> for AlertStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, UnknownStatus> {
        value.parse()
    }
}

/// Registered IoT controller
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: i32,
    pub mac_address: String,
    pub enclosure_id: Option<i32>,
    pub firmware_version: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDevice {
    pub mac_address: String,
    pub enclosure_id: Option<i32>,
    pub firmware_version: Option<String>,
    pub status: Option<DeviceStatus>,
}

/// Persisted sensor sample. Never updated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reading {
    pub reading_id: i64,
    pub device_id: i32,
    pub temperature: f64,
    pub humidity: f64,
    pub light: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: i32,
    pub temperature: f64,
    pub humidity: f64,
    pub light: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Alert {
    pub alert_id: i64,
    pub enclosure_id: i32,
    pub alert_type: String,
    pub message: String,
    #[sqlx(try_from = "String")]
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub enclosure_id: i32,
    pub alert_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Acceptable temperature band of the species living in an enclosure
#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct ClimateBand {
    pub min_temperature: f64,
    pub max_temperature: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeedingSchedule {
    pub schedule_id: i32,
    pub enclosure_id: i32,
    pub feed_time: NaiveTime,
    pub portion_size: Option<f64>,
    pub food_type: Option<String>,
    pub days_of_week: Option<String>,
}

/// Synchronous (HTTP) telemetry submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    pub mac_address: String,
    pub temperature: f64,
    pub humidity: f64,
    #[serde(default)]
    pub light: Option<f64>,
}

/// Payload published by enclosure controllers on the telemetry topic.
///
/// Fields stay raw JSON: a controller whose sensor failed sends
/// `"temp": null`, some firmware sends numbers as strings or relay states
/// as booleans, and older firmware omits the actuator fields. Only `temp`
/// and `hum` are interpreted, by `validate::validate_bus`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusTelemetry {
    #[serde(default)]
    pub aviary_id: Option<serde_json::Value>,
    #[serde(default)]
    pub temp: Option<serde_json::Value>,
    #[serde(default)]
    pub hum: Option<serde_json::Value>,
    #[serde(default)]
    pub heater: Option<serde_json::Value>,
    #[serde(default)]
    pub fan: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestOutcome {
    pub accepted: bool,
    pub alerts_raised: Vec<String>,
}

/// REST response for the synchronous ingest endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: String,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedingEntry {
    pub time: String,
    pub portion: Option<f64>,
    pub food_type: Option<String>,
}

/// Settings pulled by a controller at boot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub target_temperature_min: f64,
    pub target_temperature_max: f64,
    pub feeding_schedule: Vec<FeedingEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub offline_devices_detected: usize,
    pub newly_offline: usize,
    pub db_connection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureAverage {
    pub enclosure_id: i32,
    pub avg_temp_24h: f64,
}
