//! Data model: feed events, scheduler state, and aggregate query results.

pub mod aggregate;
pub mod event;
pub mod state;

pub use aggregate::{
    AggregateBucket, AggregateSource, EventCounts, HealthStatus, IntervalStats,
    PullRequestMetrics, StorageHealth, TimeWindow,
};
pub use event::{Event, EventType};
pub use state::ClientState;
