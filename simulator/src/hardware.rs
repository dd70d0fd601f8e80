//! Simulated enclosure hardware.
//!
//! The controller talks to hardware through two ports: [`ClimateSensor`] for
//! reads and [`Actuators`] for relay and servo commands. The simulated
//! implementations share one [`Environment`] so that switching the heater
//! on actually warms the air the sensor measures on its next read.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const HEATER_WARMING: f64 = 0.8;
const HEATER_DRYING: f64 = 0.2;
const FAN_COOLING: f64 = 0.6;
const AMBIENT_DRIFT: f64 = 0.1;
const HUMIDITY_JITTER: f64 = 0.5;

/// Servo angle while the feeder hatch is open.
pub const FEEDER_OPEN_ANGLE: u32 = 90;
pub const FEEDER_CLOSED_ANGLE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
}

/// Read-side port
pub trait ClimateSensor {
    /// One measurement, `None` on a failed read.
    fn read(&mut self) -> Option<SensorReading>;
}

/// Write-side port
pub trait Actuators {
    fn set_heater(&mut self, on: bool);

    fn set_fan(&mut self, on: bool);

    /// Drives the feeder servo and returns the PWM duty written.
    fn move_servo(&mut self, angle: u32) -> u32;
}

/// Physical state of one enclosure
#[derive(Debug, Clone, PartialEq)]
pub struct Environment {
    pub temperature: f64,
    pub humidity: f64,
    pub ambient: f64,
    pub heater_on: bool,
    pub fan_on: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            temperature: 20.0,
            humidity: 50.0,
            ambient: 20.0,
            heater_on: false,
            fan_on: false,
        }
    }
}

impl Environment {
    /// Advances the environment by one measurement period.
    fn advance(&mut self, rng: &mut impl Rng, noise: f64) {
        if self.heater_on {
            self.temperature += HEATER_WARMING;
            self.humidity -= HEATER_DRYING;
        } else if self.fan_on {
            self.temperature -= FAN_COOLING;
        }

        if self.temperature > self.ambient {
            self.temperature -= AMBIENT_DRIFT;
        } else if self.temperature < self.ambient {
            self.temperature += AMBIENT_DRIFT;
        }

        if noise > 0.0 {
            self.temperature += rng.gen_range(-noise..=noise);
            self.humidity += rng.gen_range(-HUMIDITY_JITTER..=HUMIDITY_JITTER);
        }
        self.humidity = self.humidity.clamp(0.0, 100.0);
    }
}

pub type SharedEnvironment = Arc<Mutex<Environment>>;

fn lock(env: &SharedEnvironment) -> MutexGuard<'_, Environment> {
    env.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// PWM duty (10-bit, 50 Hz) for a servo angle in degrees.
pub fn servo_duty(angle: u32) -> u32 {
    let pulse_us = (angle as f64 * 2000.0 / 180.0) + 500.0;
    (pulse_us / 20000.0 * 1023.0) as u32
}

/// DHT22 stand-in reading from the shared environment
pub struct SimulatedDht22 {
    env: SharedEnvironment,
    rng: StdRng,
    noise: f64,
    failure_rate: f64,
}

impl SimulatedDht22 {
    pub fn new(env: SharedEnvironment, noise: f64, failure_rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            env,
            rng,
            noise: noise.max(0.0),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl ClimateSensor for SimulatedDht22 {
    fn read(&mut self) -> Option<SensorReading> {
        let mut env = lock(&self.env);
        env.advance(&mut self.rng, self.noise);

        if self.failure_rate > 0.0 && self.rng.gen_bool(self.failure_rate) {
            debug!("Simulated sensor read failure");
            return None;
        }

        Some(SensorReading {
            temperature: (env.temperature * 10.0).round() / 10.0,
            humidity: (env.humidity * 10.0).round() / 10.0,
        })
    }
}

/// Heater relay, fan relay and feeder servo wired to the shared environment
pub struct SimulatedBoard {
    env: SharedEnvironment,
    servo_duty: u32,
}

impl SimulatedBoard {
    pub fn new(env: SharedEnvironment) -> Self {
        Self {
            env,
            servo_duty: servo_duty(FEEDER_CLOSED_ANGLE),
        }
    }

    pub fn servo_duty(&self) -> u32 {
        self.servo_duty
    }
}

impl Actuators for SimulatedBoard {
    fn set_heater(&mut self, on: bool) {
        let mut env = lock(&self.env);
        if env.heater_on != on {
            info!("Heater -> {}", if on { "ON" } else { "OFF" });
        }
        env.heater_on = on;
    }

    fn set_fan(&mut self, on: bool) {
        let mut env = lock(&self.env);
        if env.fan_on != on {
            info!("Fan -> {}", if on { "ON" } else { "OFF" });
        }
        env.fan_on = on;
    }

    fn move_servo(&mut self, angle: u32) -> u32 {
        let duty = servo_duty(angle.min(180));
        if self.servo_duty.abs_diff(duty) > 10 {
            debug!(angle, duty, "Servo moved");
        }
        self.servo_duty = duty;
        duty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_rig(env: Environment) -> (SimulatedDht22, SimulatedBoard, SharedEnvironment) {
        let env = Arc::new(Mutex::new(env));
        (
            SimulatedDht22::new(env.clone(), 0.0, 0.0, Some(7)),
            SimulatedBoard::new(env.clone()),
            env,
        )
    }

    #[test]
    fn test_servo_duty_formula() {
        assert_eq!(servo_duty(0), 25);
        assert_eq!(servo_duty(90), 76);
        assert_eq!(servo_duty(180), 127);
    }

    #[test]
    fn test_heater_warms_and_dries() {
        let (mut sensor, mut board, _) = quiet_rig(Environment::default());
        board.set_heater(true);

        let reading = sensor.read().unwrap();
        // +0.8 from the heater, -0.1 drift back to ambient.
        assert_eq!(reading.temperature, 20.7);
        assert_eq!(reading.humidity, 49.8);
    }

    #[test]
    fn test_fan_cools() {
        let (mut sensor, mut board, _) = quiet_rig(Environment {
            temperature: 26.0,
            ..Environment::default()
        });
        board.set_fan(true);

        let reading = sensor.read().unwrap();
        assert_eq!(reading.temperature, 25.3);
    }

    #[test]
    fn test_idle_drifts_to_ambient() {
        let (mut sensor, _, env) = quiet_rig(Environment {
            temperature: 19.0,
            ..Environment::default()
        });
        assert_eq!(sensor.read().unwrap().temperature, 19.1);
        assert!(lock(&env).temperature < 20.0);
    }

    #[test]
    fn test_failure_rate_one_always_fails() {
        let env = Arc::new(Mutex::new(Environment::default()));
        let mut sensor = SimulatedDht22::new(env, 0.0, 1.0, Some(1));
        assert!(sensor.read().is_none());
    }

    #[test]
    fn test_noise_is_bounded() {
        let env = Arc::new(Mutex::new(Environment::default()));
        let mut sensor = SimulatedDht22::new(env.clone(), 1.0, 0.0, Some(42));
        for _ in 0..100 {
            let before = lock(&env).temperature;
            let reading = sensor.read().unwrap();
            assert!((reading.temperature - before).abs() <= 1.2);
            assert!((0.0..=100.0).contains(&reading.humidity));
        }
    }
}
