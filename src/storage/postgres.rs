//! Durable PostgreSQL backend.
//!
//! Ingestion and query serving each get their own connection pool, built
//! once at connect time. Inserts run the second dedup tier (an existence
//! check over the batch's ids) and update the `pr_rollup` table in the same
//! transaction as the event rows.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::rollup::{bucket_deltas, summarize};
use super::{EventStore, no_pull_requests};
use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::model::event::is_pull_request_opened;
use crate::model::{
    AggregateBucket, AggregateSource, Event, EventCounts, EventType, HealthStatus, IntervalStats,
    PullRequestMetrics, StorageHealth, TimeWindow,
};
use crate::telemetry::metrics;

/// PostgreSQL handle. Owns one pool per execution context.
pub struct PgStore {
    ingest: PgPool,
    query: PgPool,
    /// Monthly partitions already known to exist.
    partitions: Mutex<HashSet<String>>,
    insert_failures: AtomicU32,
    last_insert_error: Mutex<Option<String>>,
}

impl PgStore {
    /// Connect both pools.
    pub async fn connect(url: &str, ingest_pool_size: u32, query_pool_size: u32) -> Result<Self> {
        let ingest = PgPoolOptions::new()
            .max_connections(ingest_pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        let query = PgPoolOptions::new()
            .max_connections(query_pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        Ok(Self {
            ingest,
            query,
            partitions: Mutex::new(HashSet::new()),
            insert_failures: AtomicU32::new(0),
            last_insert_error: Mutex::new(None),
        })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.ingest)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Ids from `ids` that are already stored.
    async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT event_id FROM events WHERE event_id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.ingest)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Create the monthly partitions a batch needs.
    async fn ensure_partitions(&self, events: &[Event]) -> Result<()> {
        let months: BTreeSet<(i32, u32)> = events
            .iter()
            .map(|e| (e.created_at.year(), e.created_at.month()))
            .collect();

        for (year, month) in months {
            let name = format!("events_y{year:04}m{month:02}");
            if self.known_partition(&name) {
                continue;
            }
            let (from, to) = month_bounds(year, month)?;
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {name} PARTITION OF events \
                 FOR VALUES FROM ('{}') TO ('{}')",
                from.to_rfc3339(),
                to.to_rfc3339()
            );
            sqlx::query(&ddl).execute(&self.ingest).await?;
            debug!(partition = %name, "ensured events partition");
            self.lock_partitions().insert(name);
        }
        Ok(())
    }

    fn known_partition(&self, name: &str) -> bool {
        self.lock_partitions().contains(name)
    }

    fn lock_partitions(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert rows that are not already stored and fold the inserted
    /// qualifying rows into the rollup, in one transaction.
    async fn insert_rows(&self, events: &[Event]) -> Result<u64> {
        self.ensure_partitions(events).await?;

        let mut ids = Vec::with_capacity(events.len());
        let mut types = Vec::with_capacity(events.len());
        let mut repo_names = Vec::with_capacity(events.len());
        let mut repo_ids = Vec::with_capacity(events.len());
        let mut created = Vec::with_capacity(events.len());
        let mut actions: Vec<Option<String>> = Vec::with_capacity(events.len());
        let mut ingested = Vec::with_capacity(events.len());
        for e in events {
            ids.push(e.id.clone());
            types.push(e.event_type.as_str().to_string());
            repo_names.push(e.repo_name.clone());
            repo_ids.push(e.repo_id);
            created.push(e.created_at);
            actions.push(e.action.clone());
            ingested.push(e.ingested_at);
        }

        let mut tx = self.ingest.begin().await?;

        let inserted: Vec<(String, String, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            "INSERT INTO events (event_id, event_type, repo_name, repo_id, created_at, action, ingested_at)
             SELECT * FROM UNNEST($1::text[], $2::text[]::event_type[], $3::text[], $4::bigint[],
                                  $5::timestamptz[], $6::text[], $7::timestamptz[])
             ON CONFLICT DO NOTHING
             RETURNING event_type::text, repo_name, action, created_at",
        )
        .bind(&ids)
        .bind(&types)
        .bind(&repo_names)
        .bind(&repo_ids)
        .bind(&created)
        .bind(&actions)
        .bind(&ingested)
        .fetch_all(&mut *tx)
        .await?;

        let qualifying = inserted.iter().filter_map(|(ty, repo, action, created_at)| {
            let ty = ty.parse::<EventType>().ok()?;
            is_pull_request_opened(ty, action.as_deref()).then_some((repo.as_str(), *created_at))
        });
        let deltas = bucket_deltas(qualifying);

        if !deltas.is_empty() {
            let repos: Vec<&str> = deltas.iter().map(|b| b.repo_name.as_str()).collect();
            let hours: Vec<DateTime<Utc>> = deltas.iter().map(|b| b.hour_bucket).collect();
            let counts: Vec<i64> = deltas.iter().map(|b| b.count as i64).collect();
            let firsts: Vec<DateTime<Utc>> = deltas.iter().map(|b| b.first_ts).collect();
            let lasts: Vec<DateTime<Utc>> = deltas.iter().map(|b| b.last_ts).collect();

            sqlx::query(
                "INSERT INTO pr_rollup (repo_name, hour_bucket, count, first_ts, last_ts)
                 SELECT * FROM UNNEST($1::text[], $2::timestamptz[], $3::bigint[],
                                      $4::timestamptz[], $5::timestamptz[])
                 ON CONFLICT (repo_name, hour_bucket) DO UPDATE SET
                    count    = pr_rollup.count + EXCLUDED.count,
                    first_ts = LEAST(pr_rollup.first_ts, EXCLUDED.first_ts),
                    last_ts  = GREATEST(pr_rollup.last_ts, EXCLUDED.last_ts)",
            )
            .bind(&repos)
            .bind(&hours)
            .bind(&counts)
            .bind(&firsts)
            .bind(&lasts)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted.len() as u64)
    }

    fn record_insert_failure(&self, err: &Error) {
        let failures = self.insert_failures.fetch_add(1, Ordering::Relaxed) + 1;
        *self
            .last_insert_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.to_string());
        metrics::insert_failures().add(1, &[]);
        error!(consecutive_failures = failures, "event insert failed: {err}");
    }

    fn record_insert_success(&self) {
        if self.insert_failures.swap(0, Ordering::Relaxed) > 0 {
            *self
                .last_insert_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        }
    }

    /// Stored rollup buckets for `repo`, oldest hour first.
    pub async fn rollup_buckets(&self, repo: &str) -> Result<Vec<AggregateBucket>> {
        let rows: Vec<(String, DateTime<Utc>, i64, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT repo_name, hour_bucket, count, first_ts, last_ts
                 FROM pr_rollup WHERE repo_name = $1
                 ORDER BY hour_bucket",
            )
            .bind(repo)
            .fetch_all(&self.query)
            .await
            .map_err(unavailable)?;

        Ok(rows
            .into_iter()
            .map(
                |(repo_name, hour_bucket, count, first_ts, last_ts)| AggregateBucket {
                    repo_name,
                    hour_bucket,
                    count: count as u64,
                    first_ts,
                    last_ts,
                },
            )
            .collect())
    }

    /// Summary of the rollup rows for `repo`, if it has any.
    pub async fn rollup_stats(&self, repo: &str) -> Result<Option<IntervalStats>> {
        Ok(summarize(&self.rollup_buckets(repo).await?))
    }

    /// Summary computed directly from the event rows for `repo`.
    pub async fn raw_scan_stats(&self, repo: &str) -> Result<Option<IntervalStats>> {
        let row: (Option<i64>, Option<DateTime<Utc>>, Option<DateTime<Utc>>) = sqlx::query_as(
            "SELECT COUNT(*)::bigint, MIN(created_at), MAX(created_at)
             FROM events
             WHERE repo_name = $1 AND event_type = 'PullRequestEvent' AND action = 'opened'",
        )
        .bind(repo)
        .fetch_one(&self.query)
        .await
        .map_err(unavailable)?;
        Ok(stats_from_row(row))
    }

    /// Average interval computed by scanning events, ignoring the rollup.
    pub async fn query_avg_interval_raw(&self, repo: &str) -> Result<PullRequestMetrics> {
        self.raw_scan_stats(repo)
            .await?
            .map(|s| s.into_metrics(repo, AggregateSource::RawScan))
            .ok_or_else(|| no_pull_requests(repo))
    }

    /// Recompute `pr_rollup` from the events table. Returns the bucket count.
    ///
    /// Concurrent inserts wait on the table lock until the rebuild commits,
    /// then fold their rows in on top.
    pub async fn rebuild_rollups(&self) -> Result<u64> {
        let mut tx = self.ingest.begin().await?;
        sqlx::query("LOCK TABLE pr_rollup IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pr_rollup").execute(&mut *tx).await?;
        let result = sqlx::query(
            "INSERT INTO pr_rollup (repo_name, hour_bucket, count, first_ts, last_ts)
             SELECT repo_name,
                    date_trunc('hour', created_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC',
                    COUNT(*),
                    MIN(created_at),
                    MAX(created_at)
             FROM events
             WHERE event_type = 'PullRequestEvent' AND action = 'opened'
             GROUP BY 1, 2",
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EventStore for PgStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn insert(&self, events: &[Event]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let fresh = fresh_events(events, self.existing_ids(&ids).await);

        if fresh.is_empty() {
            self.record_insert_success();
            return Ok(0);
        }

        match self.insert_rows(&fresh).await {
            Ok(inserted) => {
                self.record_insert_success();
                Ok(inserted)
            }
            Err(e) => {
                self.record_insert_failure(&e);
                Err(e)
            }
        }
    }

    async fn query_event_counts(
        &self,
        event_type: Option<EventType>,
        window: TimeWindow,
    ) -> Result<EventCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT event_type::text, COUNT(*)::bigint
             FROM events
             WHERE created_at >= $1 AND created_at < $2
               AND ($3::text IS NULL OR event_type::text = $3)
             GROUP BY event_type",
        )
        .bind(window.start)
        .bind(window.end)
        .bind(event_type.map(EventType::as_str))
        .fetch_all(&self.query)
        .await
        .map_err(unavailable)?;

        let mut counts = BTreeMap::new();
        for (ty, count) in rows {
            match ty.parse::<EventType>() {
                Ok(ty) => {
                    counts.insert(ty, count as u64);
                }
                Err(e) => warn!("ignoring stored row: {e}"),
            }
        }
        Ok(EventCounts::from_counts(window, counts))
    }

    async fn query_avg_interval(&self, repo: &str) -> Result<PullRequestMetrics> {
        if let Some(stats) = self.rollup_stats(repo).await? {
            return Ok(stats.into_metrics(repo, AggregateSource::Rollup));
        }
        debug!(repo, "no rollup rows, falling back to raw scan");
        self.query_avg_interval_raw(repo).await
    }

    async fn count_repo_events(&self, repo: &str) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*)::bigint FROM events WHERE repo_name = $1")
                .bind(repo)
                .fetch_one(&self.query)
                .await
                .map_err(unavailable)?;
        Ok(count as u64)
    }

    async fn health(&self) -> StorageHealth {
        let consecutive_insert_failures = self.insert_failures.load(Ordering::Relaxed);
        let last_insert_error = self
            .last_insert_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let row: std::result::Result<(i64, Option<DateTime<Utc>>), sqlx::Error> =
            sqlx::query_as("SELECT COUNT(*)::bigint, MAX(created_at) FROM events")
                .fetch_one(&self.query)
                .await;

        match row {
            Ok((total, last_event_ts)) => StorageHealth {
                backend: BackendKind::Postgres,
                status: if consecutive_insert_failures > 0 {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                },
                is_connected: true,
                total_events: total as u64,
                last_event_ts,
                consecutive_insert_failures,
                last_insert_error,
            },
            Err(e) => {
                error!("postgres health check failed: {e}");
                StorageHealth {
                    backend: BackendKind::Postgres,
                    status: HealthStatus::Unavailable,
                    is_connected: false,
                    total_events: 0,
                    last_event_ts: None,
                    consecutive_insert_failures,
                    last_insert_error,
                }
            }
        }
    }
}

fn unavailable(e: sqlx::Error) -> Error {
    Error::Unavailable(e.to_string())
}

fn stats_from_row(
    (count, first, last): (Option<i64>, Option<DateTime<Utc>>, Option<DateTime<Utc>>),
) -> Option<IntervalStats> {
    match (count, first, last) {
        (Some(count), Some(first), Some(last)) if count > 0 => Some(IntervalStats {
            count: count as u64,
            first,
            last,
        }),
        _ => None,
    }
}

/// `[first of month, first of next month)` in UTC.
fn month_bounds(year: i32, month: u32) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single();
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single();
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(Error::Other(format!("invalid partition month {year}-{month}"))),
    }
}

/// Events whose id is not in `existing`. When the existence check itself
/// failed the whole batch goes through.
fn fresh_events(events: &[Event], existing: Result<HashSet<String>>) -> Vec<Event> {
    match existing {
        Ok(existing) => {
            let fresh: Vec<Event> = events
                .iter()
                .filter(|e| !existing.contains(&e.id))
                .cloned()
                .collect();
            debug!(
                batch = events.len(),
                already_stored = events.len() - fresh.len(),
                "existence check done"
            );
            fresh
        }
        Err(e) => {
            // The primary key still rejects exact (id, created_at) repeats.
            warn!("existence check failed, inserting whole batch: {e}");
            events.to_vec()
        }
    }
}
