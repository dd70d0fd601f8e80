use chrono::{NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

/// Seconds into the scheduled minute during which a feed may fire.
pub const DEBOUNCE_SECS: u32 = 5;

/// Minimum gap between two feed actions.
pub const FEED_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid feeding time {0:?}, expected HH:MM")]
    InvalidTime(String),
}

/// Wall-clock feeding plan with debounce and cooldown
#[derive(Debug, Clone, Default)]
pub struct FeedingScheduler {
    times: Vec<(u32, u32)>,
    last_fed: Option<NaiveDateTime>,
}

impl FeedingScheduler {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Result<Self, ScheduleError> {
        let mut scheduler = Self::default();
        scheduler.replace_schedule(entries)?;
        Ok(scheduler)
    }

    /// Installs a new plan. On error the old plan is kept.
    pub fn replace_schedule<S: AsRef<str>>(&mut self, entries: &[S]) -> Result<(), ScheduleError> {
        let times = entries
            .iter()
            .map(|entry| parse_hhmm(entry.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        self.times = times;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// True in the first few seconds of a scheduled minute.
    pub fn is_due(&self, time_of_day: NaiveTime) -> bool {
        time_of_day.second() < DEBOUNCE_SECS
            && self
                .times
                .iter()
                .any(|&(h, m)| h == time_of_day.hour() && m == time_of_day.minute())
    }

    /// Fires at most once per cooldown. Records `now` when it fires.
    pub fn try_feed(&mut self, now: NaiveDateTime) -> bool {
        if !self.is_due(now.time()) {
            return false;
        }
        if let Some(last) = self.last_fed {
            if (now - last).num_seconds() < FEED_COOLDOWN_SECS {
                return false;
            }
        }
        self.last_fed = Some(now);
        true
    }

    pub fn last_fed(&self) -> Option<NaiveDateTime> {
        self.last_fed
    }
}

fn parse_hhmm(raw: &str) -> Result<(u32, u32), ScheduleError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .map(|t| (t.hour(), t.minute()))
        .map_err(|_| ScheduleError::InvalidTime(raw.to_string()))
}
