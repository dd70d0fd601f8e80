use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Per-device minimum interval between persisted readings.
///
/// State lives only in this process and starts empty on restart.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_accepted: Mutex<HashMap<i32, DateTime<Utc>>>,
}

/// Reservation handed out by [`Throttle::try_acquire`].
///
/// Hand it back through [`Throttle::release`] when the write it guarded
/// failed, so the next message for the device is not held back.
#[derive(Debug)]
#[must_use]
pub struct ThrottlePermit {
    device_id: i32,
    acquired_at: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: Mutex::new(HashMap::new()),
        }
    }

    /// Opens the gate for `device_id` if the interval has elapsed since the
    /// last accepted write and records `now` as the new reference point.
    pub fn try_acquire(&self, device_id: i32, now: DateTime<Utc>) -> Option<ThrottlePermit> {
        let mut map = self.lock();
        let previous = map.get(&device_id).copied();

        if let Some(last) = previous {
            if now - last < self.interval {
                return None;
            }
        }

        map.insert(device_id, now);
        Some(ThrottlePermit {
            device_id,
            acquired_at: now,
            previous,
        })
    }

    /// Rolls back a reservation. A newer reservation for the same device is
    /// left untouched.
    pub fn release(&self, permit: ThrottlePermit) {
        let mut map = self.lock();
        if map.get(&permit.device_id) != Some(&permit.acquired_at) {
            return;
        }
        match permit.previous {
            Some(previous) => {
                map.insert(permit.device_id, previous);
            }
            None => {
                map.remove(&permit.device_id);
            }
        }
    }

    pub fn last_accepted(&self, device_id: i32) -> Option<DateTime<Utc>> {
        self.lock().get(&device_id).copied()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i32, DateTime<Utc>>> {
        // The map holds plain timestamps, so a poisoned guard is still usable.
        self.last_accepted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_first_message_passes() {
        let throttle = Throttle::new(Duration::seconds(180));
        assert!(throttle.try_acquire(1, t0()).is_some());
        assert_eq!(throttle.last_accepted(1), Some(t0()));
    }

    #[test]
    fn test_closed_within_interval() {
        let throttle = Throttle::new(Duration::seconds(180));
        let _permit = throttle.try_acquire(1, t0()).unwrap();
        assert!(throttle
            .try_acquire(1, t0() + Duration::seconds(179))
            .is_none());
        assert!(throttle
            .try_acquire(1, t0() + Duration::seconds(180))
            .is_some());
    }

    #[test]
    fn test_devices_are_independent() {
        let throttle = Throttle::new(Duration::seconds(180));
        let _a = throttle.try_acquire(1, t0()).unwrap();
        assert!(throttle.try_acquire(2, t0()).is_some());
    }

    #[test]
    fn test_release_restores_previous() {
        let throttle = Throttle::new(Duration::seconds(180));
        let _first = throttle.try_acquire(1, t0()).unwrap();

        let later = t0() + Duration::seconds(200);
        let second = throttle.try_acquire(1, later).unwrap();
        throttle.release(second);

        assert_eq!(throttle.last_accepted(1), Some(t0()));
        assert!(throttle.try_acquire(1, later).is_some());
    }

    #[test]
    fn test_release_of_first_permit_clears_entry() {
        let throttle = Throttle::new(Duration::seconds(180));
        let permit = throttle.try_acquire(1, t0()).unwrap();
        throttle.release(permit);
        assert_eq!(throttle.last_accepted(1), None);
    }
}
