use clap::Parser;
use std::time::Duration;

use crate::thermostat::Band;

/// Simulated enclosure controllers publishing to the zoo telemetry bus
#[derive(Debug, Clone, Parser)]
#[command(name = "simulator", version)]
pub struct Args {
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    pub broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub port: u16,

    /// Number of independent controllers to run
    #[arg(long, env = "DEVICES", default_value_t = 1)]
    pub devices: u32,

    /// Enclosure number of the first controller (AV_001, AV_002, ...)
    #[arg(long, env = "FIRST_AVIARY", default_value_t = 1)]
    pub first_aviary: u32,

    /// Seconds between control cycles
    #[arg(long, env = "TICK_SECS", default_value_t = 5)]
    pub tick_secs: u64,

    /// Backend base URL for the boot-time config pull; skipped when unset
    #[arg(long, env = "BACKEND_URL")]
    pub backend_url: Option<String>,

    /// MAC prefix; the aviary number is appended as the last octet
    #[arg(long, env = "MAC_PREFIX", default_value = "AA:BB:CC:DD:EE")]
    pub mac_prefix: String,

    #[arg(long, env = "TEMP_MIN", default_value_t = 20.0)]
    pub temp_min: f64,

    #[arg(long, env = "TEMP_MAX", default_value_t = 25.0)]
    pub temp_max: f64,

    #[arg(long, env = "HYSTERESIS", default_value_t = 0.5)]
    pub hysteresis: f64,

    /// Local feeding times, HH:MM, until the backend supplies a plan
    #[arg(long = "feed", env = "FEEDING_SCHEDULE", value_delimiter = ',')]
    pub feeding_schedule: Vec<String>,

    /// Amplitude of the sensor noise in °C
    #[arg(long, env = "SENSOR_NOISE", default_value_t = 1.0)]
    pub noise: f64,

    /// Probability that a sensor read fails
    #[arg(long, env = "SENSOR_FAILURE_RATE", default_value_t = 0.0)]
    pub failure_rate: f64,

    /// How long the feeder hatch stays open, in milliseconds
    #[arg(long, env = "SERVO_HOLD_MS", default_value_t = 1000)]
    pub servo_hold_ms: u64,
}

impl Args {
    pub fn band(&self) -> Band {
        Band {
            t_min: self.temp_min,
            t_max: self.temp_max,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn servo_hold(&self) -> Duration {
        Duration::from_millis(self.servo_hold_ms)
    }

    /// MQTT client id, unique per call.
    pub fn client_id(&self) -> String {
        format!("zoo-sim-{}", uuid::Uuid::new_v4())
    }

    /// Identity of the `index`-th controller: (aviary id, MAC address)
    pub fn identity(&self, index: u32) -> (String, String) {
        let aviary = self.first_aviary + index;
        (
            format!("AV_{aviary:03}"),
            format!("{}:{:02X}", self.mac_prefix, aviary % 256),
        )
    }
}
