//! Storage abstraction shared by the ingestion and query paths.
//!
//! [`EventStore`] is the only thing either path sees. The backend is chosen
//! once in [`open_store`] and never switched while the process runs.

pub mod memory;
pub mod postgres;
pub mod rollup;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::sync::Arc;

use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use crate::model::{Event, EventCounts, EventType, PullRequestMetrics, StorageHealth, TimeWindow};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Capability set every backend provides with identical result semantics.
///
/// Implementations must tolerate concurrent inserts and queries.
#[async_trait]
pub trait EventStore: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Store events whose ids are not yet present. Returns how many were
    /// newly stored. An id already stored keeps its original row.
    async fn insert(&self, events: &[Event]) -> Result<u64>;

    /// Counts per type for events created inside `window`, optionally
    /// restricted to one type.
    async fn query_event_counts(
        &self,
        event_type: Option<EventType>,
        window: TimeWindow,
    ) -> Result<EventCounts>;

    /// Mean time between opened pull requests for `repo`.
    ///
    /// Fails with [`Error::NoData`] when the repo has no opened pull requests.
    async fn query_avg_interval(&self, repo: &str) -> Result<PullRequestMetrics>;

    /// Total stored events of any type for `repo`.
    async fn count_repo_events(&self, repo: &str) -> Result<u64>;

    /// Connectivity and ingestion status. Never fails; problems are reported
    /// in the returned status.
    async fn health(&self) -> StorageHealth;
}

/// Build the configured backend.
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn EventStore>> {
    match config.backend {
        BackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
        BackendKind::Postgres => {
            let url = config.database_url.as_ref().ok_or_else(|| {
                Error::Config("DATABASE_URL is required for the postgres backend".into())
            })?;
            let store = PgStore::connect(
                url.expose_secret(),
                config.ingest_pool_size,
                config.query_pool_size,
            )
            .await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

pub(crate) fn no_pull_requests(repo: &str) -> Error {
    Error::NoData(format!("opened pull requests in {repo}"))
}
