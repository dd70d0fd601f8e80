use serde::{Deserialize, Serialize};
use std::fmt;

/// Margin outside the band beyond which an active controller reports a
/// critical condition.
pub const CRITICAL_MARGIN: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClimateStatus {
    Stable,
    Heating,
    Cooling,
    Error,
}

impl fmt::Display for ClimateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClimateStatus::Stable => "stable",
            ClimateStatus::Heating => "heating",
            ClimateStatus::Cooling => "cooling",
            ClimateStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Target temperature band in °C
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub t_min: f64,
    pub t_max: f64,
}

impl Default for Band {
    fn default() -> Self {
        Self {
            t_min: 20.0,
            t_max: 25.0,
        }
    }
}

/// Result of one thermostat step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub status: ClimateStatus,
    pub heater_on: bool,
    pub fan_on: bool,
}

/// Hysteresis controller for one heater relay and one fan relay.
///
/// Actuator state is remembered between calls; inside the hysteresis gap a
/// relay keeps whatever it was doing.
#[derive(Debug, Clone)]
pub struct Thermostat {
    band: Band,
    hysteresis: f64,
    heater_on: bool,
    fan_on: bool,
}

impl Thermostat {
    pub fn new(band: Band, hysteresis: f64) -> Self {
        Self {
            band,
            hysteresis,
            heater_on: false,
            fan_on: false,
        }
    }

    pub fn band(&self) -> Band {
        self.band
    }

    /// Swaps the band after a config pull. Relay memory is kept.
    pub fn set_band(&mut self, band: Band) {
        self.band = band;
    }

    pub fn step(&mut self, temperature: Option<f64>) -> Decision {
        let Some(t) = temperature else {
            self.heater_on = false;
            self.fan_on = false;
            return Decision {
                status: ClimateStatus::Error,
                heater_on: false,
                fan_on: false,
            };
        };

        let Band { t_min, t_max } = self.band;
        let h = self.hysteresis;

        if t <= t_min - h {
            self.heater_on = true;
        } else if t >= t_min {
            self.heater_on = false;
        }

        if t >= t_max + h {
            self.fan_on = true;
        } else if t <= t_max {
            self.fan_on = false;
        }

        // Never heat and cool at once; cooling wins.
        if self.fan_on {
            self.heater_on = false;
        }

        let status = if self.fan_on {
            ClimateStatus::Cooling
        } else if self.heater_on {
            ClimateStatus::Heating
        } else {
            ClimateStatus::Stable
        };

        Decision {
            status,
            heater_on: self.heater_on,
            fan_on: self.fan_on,
        }
    }

    /// True when an actively regulating controller is still more than
    /// [`CRITICAL_MARGIN`] outside its band.
    pub fn is_critical(&self, temperature: Option<f64>, status: ClimateStatus) -> bool {
        let Some(t) = temperature else {
            return false;
        };
        status != ClimateStatus::Stable
            && (t < self.band.t_min - CRITICAL_MARGIN || t > self.band.t_max + CRITICAL_MARGIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thermostat() -> Thermostat {
        Thermostat::new(Band::default(), 0.5)
    }

    #[test]
    fn test_heater_hysteresis() {
        let mut t = thermostat();

        let d = t.step(Some(19.4));
        assert!(d.heater_on);
        assert_eq!(d.status, ClimateStatus::Heating);

        // Inside the gap the heater keeps running.
        assert!(t.step(Some(19.6)).heater_on);
        assert!(t.step(Some(19.9)).heater_on);

        let d = t.step(Some(20.0));
        assert!(!d.heater_on);
        assert_eq!(d.status, ClimateStatus::Stable);

        // And stays off until the lower edge is crossed again.
        assert!(!t.step(Some(19.6)).heater_on);
    }

    #[test]
    fn test_fan_hysteresis() {
        let mut t = thermostat();

        assert!(!t.step(Some(25.4)).fan_on);
        let d = t.step(Some(25.5));
        assert!(d.fan_on);
        assert_eq!(d.status, ClimateStatus::Cooling);

        assert!(t.step(Some(25.2)).fan_on);
        assert!(!t.step(Some(25.0)).fan_on);
    }

    #[test]
    fn test_relays_never_both_on() {
        // An inverted band makes both conditions true at once.
        let mut t = Thermostat::new(Band { t_min: 30.0, t_max: 10.0 }, 0.5);
        let d = t.step(Some(20.0));
        assert!(d.fan_on);
        assert!(!d.heater_on);
        assert_eq!(d.status, ClimateStatus::Cooling);

        let mut t = thermostat();
        for temp in [15.0, 19.0, 19.8, 22.0, 26.0, 25.3, 24.0, 18.0] {
            let d = t.step(Some(temp));
            assert!(!(d.heater_on && d.fan_on), "both relays on at {temp}");
        }
    }

    #[test]
    fn test_sensor_failure_is_error() {
        let mut t = thermostat();
        t.step(Some(10.0));
        let d = t.step(None);
        assert_eq!(d.status, ClimateStatus::Error);
        assert!(!d.heater_on);
        assert!(!d.fan_on);
    }

    #[test]
    fn test_set_band_keeps_relay_memory() {
        let mut t = thermostat();
        assert!(t.step(Some(19.0)).heater_on);

        t.set_band(Band { t_min: 19.5, t_max: 24.0 });
        // 19.2 is inside the new gap, so the heater stays on.
        assert!(t.step(Some(19.2)).heater_on);
        assert_eq!(t.band().t_min, 19.5);
    }

    #[test]
    fn test_critical_flag() {
        let t = thermostat();
        assert!(t.is_critical(Some(17.9), ClimateStatus::Heating));
        assert!(!t.is_critical(Some(17.9), ClimateStatus::Stable));
        assert!(!t.is_critical(Some(18.5), ClimateStatus::Heating));
        assert!(t.is_critical(Some(27.5), ClimateStatus::Cooling));
        assert!(!t.is_critical(None, ClimateStatus::Error));
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_string(&ClimateStatus::Heating).unwrap(), "\"heating\"");
        assert_eq!(ClimateStatus::Cooling.to_string(), "cooling");
    }
}
