use serde::{Deserialize, Serialize};

use crate::thermostat::ClimateStatus;

pub const TELEMETRY_TOPIC: &str = "zoo/telemetry";
pub const ALERT_TOPIC: &str = "zoo/alerts";
pub const EVENT_TOPIC: &str = "zoo/events";

/// Periodic controller state, published on [`TELEMETRY_TOPIC`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub aviary_id: String,
    /// Filtered temperature; `null` after a failed sensor read.
    pub temp: Option<f64>,
    pub hum: Option<f64>,
    pub heater: u8,
    pub fan: u8,
    pub status: ClimateStatus,
    /// Unix seconds
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalAlert {
    pub level: String,
    pub msg: String,
}

impl CriticalAlert {
    pub fn temperature(temperature: f64) -> Self {
        Self {
            level: "CRITICAL".to_string(),
            msg: format!("Temp warning: {temperature}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedingEvent {
    pub event: String,
    pub time: f64,
}

impl FeedingEvent {
    pub fn done(time: f64) -> Self {
        Self {
            event: "FEEDING_DONE".to_string(),
            time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_telemetry_wire_shape() {
        let message = Telemetry {
            aviary_id: "AV_001".to_string(),
            temp: None,
            hum: Some(48.5),
            heater: 0,
            fan: 0,
            status: ClimateStatus::Error,
            timestamp: 1714564800.0,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "aviary_id": "AV_001",
                "temp": null,
                "hum": 48.5,
                "heater": 0,
                "fan": 0,
                "status": "error",
                "timestamp": 1714564800.0
            })
        );
    }

    #[test]
    fn test_alert_and_event_shape() {
        assert_eq!(
            serde_json::to_value(CriticalAlert::temperature(17.4)).unwrap(),
            json!({ "level": "CRITICAL", "msg": "Temp warning: 17.4" })
        );
        assert_eq!(
            serde_json::to_value(FeedingEvent::done(10.5)).unwrap(),
            json!({ "event": "FEEDING_DONE", "time": 10.5 })
        );
    }
}
