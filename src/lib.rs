//! # ghstats-rs
//!
//! Ingests the GitHub public events feed into a pluggable event store and
//! answers aggregate queries over it.
//!
//! The poll scheduler fetches the feed on the interval the feed advertises,
//! collapses duplicate ids within each batch, and hands the result to an
//! [`storage::EventStore`]: in-memory for development, or Postgres with an
//! hourly pull request rollup.

pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod model;
pub mod storage;
pub mod telemetry;
