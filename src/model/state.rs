//! Poll scheduling state persisted between runs.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Scheduler cadence that survives restarts.
///
/// Serialized as `{next_poll_time_ts, poll_interval_sec, last_successful_poll_ts}`
/// with epoch-second timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    /// Attempt time of the last poll plus the interval in force at that time.
    #[serde(rename = "next_poll_time_ts", with = "chrono::serde::ts_seconds")]
    pub next_poll_time: DateTime<Utc>,

    #[serde(rename = "poll_interval_sec")]
    pub poll_interval_seconds: u64,

    #[serde(
        rename = "last_successful_poll_ts",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub last_successful_poll_time: Option<DateTime<Utc>>,
}

impl ClientState {
    /// State for a first run: due immediately.
    pub fn initial(now: DateTime<Utc>, poll_interval_seconds: u64) -> Self {
        Self {
            next_poll_time: now,
            poll_interval_seconds,
            last_successful_poll_time: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_poll_time <= now
    }

    /// Record a poll attempt made at `attempted_at` and schedule the next
    /// one `interval_seconds` later.
    ///
    /// Returns `false` and leaves the state untouched when the deadline is
    /// not representable.
    #[must_use]
    pub fn reschedule(&mut self, attempted_at: DateTime<Utc>, interval_seconds: u64) -> bool {
        match after_secs(attempted_at, interval_seconds) {
            Some(next) => {
                self.next_poll_time = next;
                true
            }
            None => false,
        }
    }
}

/// `from + secs`, or `None` on overflow.
pub fn after_secs(from: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::try_seconds(i64::try_from(secs).ok()?)?;
    from.checked_add_signed(delta)
}
