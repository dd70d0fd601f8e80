use chrono::NaiveDateTime;
use std::time::Duration;
use tracing::{info, warn};

use crate::feeding::{FeedingScheduler, ScheduleError};
use crate::filter::MovingAverage;
use crate::hardware::{Actuators, ClimateSensor, FEEDER_CLOSED_ANGLE, FEEDER_OPEN_ANGLE};
use crate::sync::RemoteConfig;
use crate::telemetry::{CriticalAlert, FeedingEvent, Telemetry};
use crate::thermostat::{Band, Thermostat};

/// Everything one control cycle wants published
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub telemetry: Telemetry,
    pub alert: Option<CriticalAlert>,
    pub feeding: Option<FeedingEvent>,
}

/// One enclosure controller: sensor, filter, thermostat and feeder.
pub struct Controller<S, A> {
    aviary_id: String,
    sensor: S,
    actuators: A,
    filter: MovingAverage,
    thermostat: Thermostat,
    scheduler: FeedingScheduler,
    servo_hold: Duration,
}

impl<S: ClimateSensor, A: Actuators> Controller<S, A> {
    pub fn new(
        aviary_id: impl Into<String>,
        sensor: S,
        actuators: A,
        thermostat: Thermostat,
        scheduler: FeedingScheduler,
        servo_hold: Duration,
    ) -> Self {
        Self {
            aviary_id: aviary_id.into(),
            sensor,
            actuators,
            filter: MovingAverage::default(),
            thermostat,
            scheduler,
            servo_hold,
        }
    }

    pub fn aviary_id(&self) -> &str {
        &self.aviary_id
    }

    pub fn band(&self) -> Band {
        self.thermostat.band()
    }

    pub fn actuators(&self) -> &A {
        &self.actuators
    }

    /// Takes over band and feeding plan from a config pull.
    pub fn apply_config(&mut self, config: &RemoteConfig) -> Result<(), ScheduleError> {
        let times: Vec<&str> = config
            .feeding_schedule
            .iter()
            .map(|entry| entry.time.as_str())
            .collect();
        self.scheduler.replace_schedule(&times)?;
        self.thermostat.set_band(Band {
            t_min: config.target_temperature_min,
            t_max: config.target_temperature_max,
        });
        info!(
            aviary_id = %self.aviary_id,
            t_min = config.target_temperature_min,
            t_max = config.target_temperature_max,
            feedings = times.len(),
            "Config applied"
        );
        Ok(())
    }

    /// Runs one control cycle. `local` drives the feeding plan, `timestamp`
    /// (unix seconds) stamps the outgoing messages.
    pub async fn tick(&mut self, local: NaiveDateTime, timestamp: f64) -> TickReport {
        let reading = self.sensor.read();
        if reading.is_none() {
            warn!(aviary_id = %self.aviary_id, "Sensor read failed");
        }

        let filtered = self.filter.filter(reading.map(|r| r.temperature));
        let decision = self.thermostat.step(filtered);
        self.actuators.set_heater(decision.heater_on);
        self.actuators.set_fan(decision.fan_on);

        let alert = match filtered {
            Some(t) if self.thermostat.is_critical(filtered, decision.status) => {
                warn!(aviary_id = %self.aviary_id, temperature = t, "Critical temperature");
                Some(CriticalAlert::temperature(t))
            }
            _ => None,
        };

        let feeding = if self.scheduler.try_feed(local) {
            self.dispense().await;
            Some(FeedingEvent::done(timestamp))
        } else {
            None
        };

        TickReport {
            telemetry: Telemetry {
                aviary_id: self.aviary_id.clone(),
                temp: filtered,
                hum: reading.map(|r| r.humidity),
                heater: decision.heater_on as u8,
                fan: decision.fan_on as u8,
                status: decision.status,
                timestamp,
            },
            alert,
            feeding,
        }
    }

    async fn dispense(&mut self) {
        info!(aviary_id = %self.aviary_id, "Feeding started");
        self.actuators.move_servo(FEEDER_OPEN_ANGLE);
        tokio::time::sleep(self.servo_hold).await;
        self.actuators.move_servo(FEEDER_CLOSED_ANGLE);
        info!(aviary_id = %self.aviary_id, "Feeding done");
    }
}
