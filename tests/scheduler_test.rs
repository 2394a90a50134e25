//! Poll scheduler behavior against a scripted feed and the memory store.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use ghstats_rs::config::ScheduleConfig;
use ghstats_rs::error::{Error, Result};
use ghstats_rs::feed::{FeedBatch, FeedSource, RateQuota};
use ghstats_rs::ingest::{PollOutcome, PollScheduler, PollState, StateFile};
use ghstats_rs::model::{ClientState, Event, EventType};
use ghstats_rs::storage::{EventStore, MemoryStore};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Feed that replays a fixed script of responses.
#[derive(Default)]
struct ScriptedFeed {
    script: VecDeque<Result<FeedBatch>>,
    quota: Option<RateQuota>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFeed {
    fn then_ok(mut self, events: Vec<Event>, hint: u64) -> Self {
        self.script.push_back(Ok(FeedBatch {
            events,
            interval_hint_secs: hint,
            not_modified: false,
        }));
        self
    }

    fn then_err(mut self) -> Self {
        self.script.push_back(Err(Error::FeedStatus {
            status: 503,
            url: "https://api.github.com/events".to_string(),
        }));
        self
    }

    fn with_quota(mut self, remaining: u32, reset_at: DateTime<Utc>) -> Self {
        self.quota = Some(RateQuota {
            remaining,
            reset_at,
        });
        self
    }
}

#[async_trait]
impl FeedSource for ScriptedFeed {
    async fn fetch(&mut self) -> Result<FeedBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.pop_front().unwrap_or_else(|| {
            Ok(FeedBatch {
                events: Vec::new(),
                interval_hint_secs: 60,
                not_modified: true,
            })
        })
    }

    fn quota(&self) -> Option<RateQuota> {
        self.quota
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn schedule(dir: &TempDir) -> ScheduleConfig {
    ScheduleConfig {
        state_file: dir.path().join("client-state.json"),
        min_interval_secs: 60,
        default_interval_secs: 60,
        failure_interval_secs: 60,
        quota_min_remaining: 10,
        rate_limit_buffer_secs: 5,
    }
}

async fn scheduler(
    feed: ScriptedFeed,
    dir: &TempDir,
) -> (PollScheduler<ScriptedFeed>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn EventStore> = store.clone();
    let scheduler =
        PollScheduler::start(feed, shared, schedule(dir), CancellationToken::new()).await;
    (scheduler, store)
}

async fn persist(dir: &TempDir, state: ClientState) {
    StateFile::new(dir.path().join("client-state.json"))
        .save(&state)
        .await
        .unwrap();
}

#[tokio::test]
async fn advertised_interval_sets_next_poll_time() {
    let dir = TempDir::new().unwrap();
    let t = ts(1_700_000_000);
    persist(&dir, ClientState::initial(t, 60)).await;

    let (mut scheduler, _) = scheduler(ScriptedFeed::default().then_ok(vec![], 120), &dir).await;
    let report = scheduler.poll_once(t).await;

    assert_eq!(report.outcome, PollOutcome::Success);
    assert_eq!(report.next_poll_time, t + TimeDelta::seconds(120));
    assert_eq!(scheduler.state().poll_interval_seconds, 120);
    assert_eq!(scheduler.state().last_successful_poll_time, Some(t));
    assert_eq!(
        scheduler.phase(),
        PollState::Sleeping {
            until: t + TimeDelta::seconds(120)
        }
    );

    // The new schedule survives a restart.
    let saved = StateFile::new(dir.path().join("client-state.json"))
        .load()
        .await
        .unwrap();
    assert_eq!(saved, *scheduler.state());
}

#[tokio::test]
async fn hint_below_minimum_is_clamped() {
    let dir = TempDir::new().unwrap();
    let t = ts(1_700_000_000);

    let (mut scheduler, _) = scheduler(ScriptedFeed::default().then_ok(vec![], 10), &dir).await;
    let report = scheduler.poll_once(t).await;

    assert_eq!(report.next_poll_time, t + TimeDelta::seconds(60));
    assert_eq!(scheduler.state().poll_interval_seconds, 60);
}

#[tokio::test]
async fn absurd_hint_is_capped_at_one_day() {
    let dir = TempDir::new().unwrap();
    let t = ts(1_700_000_000);

    let feed = ScriptedFeed::default()
        .then_ok(vec![], 10_000_000_000_000)
        .then_ok(vec![], u64::MAX);
    let (mut scheduler, _) = scheduler(feed, &dir).await;

    let report = scheduler.poll_once(t).await;
    assert_eq!(report.outcome, PollOutcome::Success);
    assert_eq!(report.next_poll_time, t + TimeDelta::days(1));
    assert_eq!(scheduler.state().poll_interval_seconds, 86_400);

    let later = t + TimeDelta::days(1);
    let report = scheduler.poll_once(later).await;
    assert_eq!(report.outcome, PollOutcome::Success);
    assert_eq!(report.next_poll_time, later + TimeDelta::days(1));
}

#[tokio::test]
async fn far_future_quota_reset_defers_at_most_one_day() {
    let dir = TempDir::new().unwrap();
    let now = ts(1_700_000_000);
    persist(&dir, ClientState::initial(now, 60)).await;

    let feed = ScriptedFeed::default().with_quota(0, DateTime::<Utc>::MAX_UTC);
    let (scheduler, _) = scheduler(feed, &dir).await;

    assert_eq!(
        scheduler.next_step(now),
        PollState::RateLimited {
            until: now + TimeDelta::days(1)
        }
    );
}

#[tokio::test]
async fn overdue_state_polls_immediately_after_restart() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();
    persist(
        &dir,
        ClientState {
            next_poll_time: now - TimeDelta::minutes(10),
            poll_interval_seconds: 60,
            last_successful_poll_time: Some(now - TimeDelta::minutes(11)),
        },
    )
    .await;

    let (scheduler, _) = scheduler(ScriptedFeed::default(), &dir).await;
    assert_eq!(scheduler.next_step(now), PollState::Polling);
}

#[tokio::test]
async fn future_state_sleeps_until_due() {
    let dir = TempDir::new().unwrap();
    let now = ts(1_700_000_000);
    let due = now + TimeDelta::minutes(10);
    persist(&dir, ClientState::initial(due, 60)).await;

    let (scheduler, _) = scheduler(ScriptedFeed::default(), &dir).await;
    assert_eq!(scheduler.next_step(now), PollState::Sleeping { until: due });
    assert_eq!(scheduler.next_step(due), PollState::Polling);
}

#[tokio::test]
async fn missing_or_corrupt_state_polls_immediately() {
    let dir = TempDir::new().unwrap();
    let (sched, _) = scheduler(ScriptedFeed::default(), &dir).await;
    assert_eq!(sched.next_step(Utc::now()), PollState::Polling);
    assert_eq!(sched.state().last_successful_poll_time, None);

    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("client-state.json"), b"{not json").unwrap();
    let (scheduler, _) = scheduler(ScriptedFeed::default(), &dir).await;
    assert_eq!(scheduler.next_step(Utc::now()), PollState::Polling);
}

#[tokio::test]
async fn low_quota_defers_until_reset_plus_buffer() {
    let dir = TempDir::new().unwrap();
    let now = ts(1_700_000_000);
    persist(&dir, ClientState::initial(now, 60)).await;
    let reset = now + TimeDelta::seconds(300);

    let feed = ScriptedFeed::default().with_quota(3, reset);
    let (scheduler, _) = scheduler(feed, &dir).await;

    assert_eq!(
        scheduler.next_step(now),
        PollState::RateLimited {
            until: reset + TimeDelta::seconds(5)
        }
    );
    // Once the reset time has passed the stale quota no longer blocks.
    assert_eq!(scheduler.next_step(reset), PollState::Polling);
}

#[tokio::test]
async fn healthy_quota_does_not_defer() {
    let dir = TempDir::new().unwrap();
    let now = ts(1_700_000_000);
    persist(&dir, ClientState::initial(now, 60)).await;

    let feed = ScriptedFeed::default().with_quota(10, now + TimeDelta::seconds(300));
    let (scheduler, _) = scheduler(feed, &dir).await;
    assert_eq!(scheduler.next_step(now), PollState::Polling);
}

#[tokio::test]
async fn failed_fetch_uses_fallback_and_keeps_last_success() {
    let dir = TempDir::new().unwrap();
    let earlier = ts(1_699_999_000);
    let t = ts(1_700_000_000);
    persist(
        &dir,
        ClientState {
            next_poll_time: t,
            poll_interval_seconds: 120,
            last_successful_poll_time: Some(earlier),
        },
    )
    .await;

    let (mut scheduler, store) = scheduler(ScriptedFeed::default().then_err(), &dir).await;
    let report = scheduler.poll_once(t).await;

    assert!(matches!(report.outcome, PollOutcome::Failed(_)));
    assert_eq!(report.next_poll_time, t + TimeDelta::seconds(60));
    assert_eq!(scheduler.state().poll_interval_seconds, 120);
    assert_eq!(scheduler.state().last_successful_poll_time, Some(earlier));
    assert!(store.is_empty());
}

#[tokio::test]
async fn not_modified_counts_as_success() {
    let dir = TempDir::new().unwrap();
    let t = ts(1_700_000_000);

    // An exhausted script answers 304.
    let (mut scheduler, _) = scheduler(ScriptedFeed::default(), &dir).await;
    let report = scheduler.poll_once(t).await;

    assert_eq!(report.outcome, PollOutcome::NotModified);
    assert_eq!(report.inserted, 0);
    assert_eq!(scheduler.state().last_successful_poll_time, Some(t));
}

#[tokio::test]
async fn duplicate_ids_in_batch_store_earliest_once() {
    let dir = TempDir::new().unwrap();
    let t0 = ts(1_700_000_000);
    let batch = vec![
        Event::new("e1", EventType::PullRequestEvent, "a/b", 1, t0).action("opened"),
        Event::new("e1", EventType::PullRequestEvent, "a/b", 1, t0 - TimeDelta::seconds(5))
            .action("opened"),
        Event::new("e2", EventType::WatchEvent, "a/b", 1, t0),
    ];

    let (mut scheduler, store) = scheduler(ScriptedFeed::default().then_ok(batch, 60), &dir).await;
    let report = scheduler.poll_once(t0).await;

    assert_eq!(report.fetched, 3);
    assert_eq!(report.unique, 2);
    assert_eq!(report.inserted, 2);
    assert_eq!(store.len(), 2);
    assert_eq!(
        store.get("e1").unwrap().created_at,
        t0 - TimeDelta::seconds(5)
    );
}

#[tokio::test]
async fn redelivered_id_keeps_stored_row() {
    let dir = TempDir::new().unwrap();
    let t0 = ts(1_700_000_000);
    let first = Event::new("e1", EventType::IssuesEvent, "a/b", 1, t0).action("opened");
    let again = Event::new("e1", EventType::IssuesEvent, "c/d", 2, t0 - TimeDelta::seconds(30))
        .action("closed");

    let feed = ScriptedFeed::default()
        .then_ok(vec![first.clone()], 60)
        .then_ok(vec![again], 60);
    let (mut scheduler, store) = scheduler(feed, &dir).await;

    assert_eq!(scheduler.poll_once(t0).await.inserted, 1);
    let second = scheduler.poll_once(t0 + TimeDelta::seconds(60)).await;

    assert_eq!(second.unique, 1);
    assert_eq!(second.inserted, 0);
    assert_eq!(store.get("e1").unwrap(), first);
}

#[tokio::test]
async fn run_stops_promptly_when_cancelled() {
    let dir = TempDir::new().unwrap();
    persist(&dir, ClientState::initial(Utc::now() + TimeDelta::hours(1), 60)).await;

    let (mut scheduler, _) = scheduler(ScriptedFeed::default(), &dir).await;
    let token = scheduler.shutdown_token();
    let handle = tokio::spawn(async move {
        scheduler.run().await;
        scheduler
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let scheduler = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();
    assert_eq!(scheduler.phase(), PollState::Idle);
    assert_eq!(scheduler.feed().calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn run_polls_when_due_then_sleeps() {
    let dir = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let feed = ScriptedFeed {
        calls: Arc::clone(&calls),
        ..ScriptedFeed::default()
    }
    .then_ok(
        vec![Event::new("e9", EventType::WatchEvent, "a/b", 1, Utc::now())],
        3600,
    );

    let (mut scheduler, store) = scheduler(feed, &dir).await;
    let token = scheduler.shutdown_token();
    let handle = tokio::spawn(async move { scheduler.run().await });

    for _ in 0..100 {
        if calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("scheduler did not stop")
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.len(), 1);
}
