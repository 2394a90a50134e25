//! Metric instruments for the ingestion pipeline.
//!
//! All instruments come from the global `"ghstats"` meter, so they are
//! no-ops until an OTLP endpoint installs a real provider.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter(super::SERVICE_NAME)
}

/// Counter: poll attempts.
/// Labels: `outcome` ("ok" | "not_modified" | "failed").
pub fn polls() -> Counter<u64> {
    meter()
        .u64_counter("ghstats.polls")
        .with_description("Feed poll attempts")
        .build()
}

/// Counter: polls deferred because the remaining quota was too low.
pub fn rate_limited() -> Counter<u64> {
    meter()
        .u64_counter("ghstats.polls.rate_limited")
        .with_description("Polls deferred until the rate limit resets")
        .build()
}

/// Counter: tracked events received from the feed.
pub fn events_fetched() -> Counter<u64> {
    meter()
        .u64_counter("ghstats.events.fetched")
        .with_description("Tracked events received from the feed")
        .build()
}

/// Counter: entries collapsed by batch-local dedup.
pub fn batch_duplicates() -> Counter<u64> {
    meter()
        .u64_counter("ghstats.events.batch_duplicates")
        .with_description("Duplicate ids removed within a batch")
        .build()
}

/// Counter: events newly written to storage.
/// Labels: `backend`.
pub fn events_inserted() -> Counter<u64> {
    meter()
        .u64_counter("ghstats.events.inserted")
        .with_description("Events newly stored")
        .build()
}

/// Counter: failed storage inserts.
pub fn insert_failures() -> Counter<u64> {
    meter()
        .u64_counter("ghstats.storage.insert_failures")
        .with_description("Storage insert failures")
        .build()
}

/// Histogram: wall time of one poll attempt in milliseconds.
pub fn poll_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("ghstats.poll.duration_ms")
        .with_description("Poll attempt duration in milliseconds")
        .with_unit("ms")
        .build()
}
