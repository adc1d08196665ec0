//! When a job fires.

use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Every `period`, first firing one period after the scheduler starts.
    Interval { period: Duration },
    /// Once a day at `hour:minute` UTC.
    DailyAt { hour: u32, minute: u32 },
}

impl Trigger {
    pub const fn minutes(m: u64) -> Self {
        Trigger::Interval { period: Duration::from_secs(m * 60) }
    }

    pub const fn hours(h: u64) -> Self {
        Trigger::Interval { period: Duration::from_secs(h * 3600) }
    }

    pub const fn daily(hour: u32, minute: u32) -> Self {
        Trigger::DailyAt { hour: hour % 24, minute: minute % 60 }
    }

    /// First instant strictly after `now` at which this trigger fires.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Trigger::Interval { period } => {
                now + chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::zero())
            }
            Trigger::DailyAt { hour, minute } => {
                let midnight = now
                    - chrono::Duration::seconds(i64::from(now.num_seconds_from_midnight()))
                    - chrono::Duration::nanoseconds(i64::from(now.nanosecond()));
                let today = midnight + chrono::Duration::minutes(i64::from(hour * 60 + minute));
                if today > now {
                    today
                } else {
                    today + chrono::Duration::days(1)
                }
            }
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Trigger::Interval { period } => {
                let secs = period.as_secs();
                if secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else {
                    write!(f, "every {}m", secs / 60)
                }
            }
            Trigger::DailyAt { hour, minute } => write!(f, "daily at {hour:02}:{minute:02} UTC"),
        }
    }
}
