//! Volatile in-memory backend.
//!
//! One coarse lock guards every mutation and snapshot read. Aggregates are
//! computed at query time; nothing is precomputed.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{EventStore, no_pull_requests};
use crate::config::BackendKind;
use crate::error::Result;
use crate::model::{
    AggregateSource, Event, EventCounts, EventType, HealthStatus, IntervalStats,
    PullRequestMetrics, StorageHealth, TimeWindow,
};

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    ids: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the collections intact.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stored row for `id`, if any.
    pub fn get(&self, id: &str) -> Option<Event> {
        self.lock().events.iter().find(|e| e.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn insert(&self, events: &[Event]) -> Result<u64> {
        let mut inner = self.lock();
        let mut inserted = 0;
        for event in events {
            if inner.ids.insert(event.id.clone()) {
                inner.events.push(event.clone());
                inserted += 1;
            }
        }
        if inserted > 0 {
            debug!(inserted, total = inner.events.len(), "stored events in memory");
        }
        Ok(inserted)
    }

    async fn query_event_counts(
        &self,
        event_type: Option<EventType>,
        window: TimeWindow,
    ) -> Result<EventCounts> {
        let inner = self.lock();
        let mut counts = BTreeMap::new();
        for event in inner
            .events
            .iter()
            .filter(|e| window.contains(e.created_at))
            .filter(|e| event_type.is_none_or(|t| t == e.event_type))
        {
            *counts.entry(event.event_type).or_insert(0) += 1;
        }
        Ok(EventCounts::from_counts(window, counts))
    }

    async fn query_avg_interval(&self, repo: &str) -> Result<PullRequestMetrics> {
        let stats = {
            let inner = self.lock();
            IntervalStats::from_timestamps(
                inner
                    .events
                    .iter()
                    .filter(|e| e.repo_name == repo && e.is_pull_request_opened())
                    .map(|e| e.created_at),
            )
        };
        stats
            .map(|s| s.into_metrics(repo, AggregateSource::OnDemand))
            .ok_or_else(|| no_pull_requests(repo))
    }

    async fn count_repo_events(&self, repo: &str) -> Result<u64> {
        let inner = self.lock();
        Ok(inner.events.iter().filter(|e| e.repo_name == repo).count() as u64)
    }

    async fn health(&self) -> StorageHealth {
        let inner = self.lock();
        StorageHealth {
            backend: BackendKind::Memory,
            status: HealthStatus::Healthy,
            is_connected: true,
            total_events: inner.events.len() as u64,
            last_event_ts: inner.events.iter().map(|e| e.created_at).max(),
            consecutive_insert_failures: 0,
            last_insert_error: None,
        }
    }
}
