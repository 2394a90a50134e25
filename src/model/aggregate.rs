//! Query result types shared by every storage backend.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::event::EventType;
use crate::config::BackendKind;

// ---------------------------------------------------------------------------
// Time window
// ---------------------------------------------------------------------------

/// Half-open `[start, end)` range over `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The `minutes` leading up to `now`, with `now` itself included.
    pub fn last_minutes(minutes: u32, now: DateTime<Utc>) -> Self {
        Self {
            start: now - TimeDelta::minutes(i64::from(minutes)),
            end: now + TimeDelta::milliseconds(1),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Event counts grouped by type within a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCounts {
    pub window: TimeWindow,
    pub counts: BTreeMap<EventType, u64>,
    pub total: u64,
}

impl EventCounts {
    pub fn from_counts(window: TimeWindow, counts: BTreeMap<EventType, u64>) -> Self {
        let total = counts.values().sum();
        Self {
            window,
            counts,
            total,
        }
    }
}

// ---------------------------------------------------------------------------
// Pull request interval
// ---------------------------------------------------------------------------

/// Where an aggregate answer was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateSource {
    /// Precomputed `(repo, hour)` buckets.
    Rollup,
    /// Scan over the base event rows.
    RawScan,
    /// Computed from an in-memory snapshot.
    OnDemand,
}

impl std::fmt::Display for AggregateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateSource::Rollup => "rollup",
            AggregateSource::RawScan => "raw_scan",
            AggregateSource::OnDemand => "on_demand",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestMetrics {
    pub repository: String,
    pub average_interval_secs: f64,
    pub total_pull_requests: u64,
    pub source: AggregateSource,
}

/// Count and time span of a set of qualifying events.
///
/// The mean gap between consecutive events telescopes to
/// `(last - first) / (count - 1)`, so a summary is all any backend needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalStats {
    pub count: u64,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

impl IntervalStats {
    pub fn single(ts: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            first: ts,
            last: ts,
        }
    }

    pub fn from_timestamps(timestamps: impl IntoIterator<Item = DateTime<Utc>>) -> Option<Self> {
        timestamps
            .into_iter()
            .map(Self::single)
            .reduce(|acc, s| acc.merge(s))
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            count: self.count + other.count,
            first: self.first.min(other.first),
            last: self.last.max(other.last),
        }
    }

    /// Mean seconds between consecutive events, at millisecond precision.
    pub fn average_secs(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let span_ms = (self.last - self.first).num_milliseconds() as f64;
        span_ms / 1000.0 / (self.count - 1) as f64
    }

    pub fn into_metrics(self, repository: &str, source: AggregateSource) -> PullRequestMetrics {
        PullRequestMetrics {
            repository: repository.to_string(),
            average_interval_secs: self.average_secs(),
            total_pull_requests: self.count,
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Rollup bucket
// ---------------------------------------------------------------------------

/// One `(repo, hour)` rollup row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub repo_name: String,
    pub hour_bucket: DateTime<Utc>,
    pub count: u64,
    pub first_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,
}

impl AggregateBucket {
    pub fn stats(&self) -> IntervalStats {
        IntervalStats {
            count: self.count,
            first: self.first_ts,
            last: self.last_ts,
        }
    }
}

/// Truncate a timestamp to the start of its UTC hour.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Reachable, but recent inserts have been failing.
    Degraded,
    Unavailable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unavailable => "unavailable",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageHealth {
    pub backend: BackendKind,
    pub status: HealthStatus,
    pub is_connected: bool,
    pub total_events: u64,
    pub last_event_ts: Option<DateTime<Utc>>,
    pub consecutive_insert_failures: u32,
    pub last_insert_error: Option<String>,
}
