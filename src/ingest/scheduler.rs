//! Poll scheduler: decides when to hit the feed and drives one poll at a time.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, warn};

use super::dedup::dedup_batch;
use super::state_file::StateFile;
use crate::config::{MAX_POLL_INTERVAL_SECS, ScheduleConfig};
use crate::feed::FeedSource;
use crate::model::ClientState;
use crate::model::state::after_secs;
use crate::storage::EventStore;
use crate::telemetry::metrics;
use crate::telemetry::poll::{record_phase_change, record_poll_result, start_poll_span};

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Sleeping { until: DateTime<Utc> },
    /// Quota nearly spent; waiting for the reset instead of the interval.
    RateLimited { until: DateTime<Utc> },
}

impl PollState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Sleeping { .. } => "sleeping",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Success,
    /// The feed answered 304; nothing new since the last poll.
    NotModified,
    Failed(String),
}

impl PollOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "ok",
            Self::NotModified => "not_modified",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Summary of one poll attempt.
#[derive(Debug, Clone)]
pub struct PollReport {
    pub attempted_at: DateTime<Utc>,
    pub outcome: PollOutcome,
    /// Tracked events received from the feed.
    pub fetched: usize,
    /// Events left after batch-local dedup.
    pub unique: usize,
    /// Events the store reported as newly written.
    pub inserted: u64,
    pub next_poll_time: DateTime<Utc>,
}

pub struct PollScheduler<F> {
    feed: F,
    store: Arc<dyn EventStore>,
    state_file: StateFile,
    config: ScheduleConfig,
    state: ClientState,
    phase: PollState,
    cancel: CancellationToken,
    attempts: u64,
}

impl<F: FeedSource> PollScheduler<F> {
    /// Load persisted state and build a scheduler.
    ///
    /// A missing or corrupt state file yields a first poll that is due
    /// immediately.
    pub async fn start(
        feed: F,
        store: Arc<dyn EventStore>,
        config: ScheduleConfig,
        cancel: CancellationToken,
    ) -> Self {
        let state_file = StateFile::new(config.state_file.clone());
        let state = match state_file.load().await {
            Some(state) => {
                info!(
                    next_poll_time = %state.next_poll_time,
                    poll_interval_sec = state.poll_interval_seconds,
                    "resuming poll schedule"
                );
                state
            }
            None => ClientState::initial(Utc::now(), config.default_interval_secs),
        };

        Self {
            feed,
            store,
            state_file,
            config,
            state,
            phase: PollState::Idle,
            cancel,
            attempts: 0,
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn phase(&self) -> PollState {
        self.phase
    }

    pub fn feed(&self) -> &F {
        &self.feed
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// What the scheduler should do at `now`.
    pub fn next_step(&self, now: DateTime<Utc>) -> PollState {
        if !self.state.is_due(now) {
            return PollState::Sleeping {
                until: self.state.next_poll_time,
            };
        }
        if let Some(quota) = self.feed.quota() {
            if quota.remaining < self.config.quota_min_remaining && quota.reset_at > now {
                let resume = after_secs(quota.reset_at, self.config.rate_limit_buffer_secs)
                    .unwrap_or(quota.reset_at);
                let ceiling = after_secs(now, MAX_POLL_INTERVAL_SECS).unwrap_or(resume);
                return PollState::RateLimited {
                    until: resume.min(ceiling),
                };
            }
        }
        PollState::Polling
    }

    /// Run until the cancellation token fires.
    pub async fn run(&mut self) {
        info!(state_file = %self.state_file.path().display(), "poll scheduler started");

        while !self.cancel.is_cancelled() {
            let now = Utc::now();
            match self.next_step(now) {
                PollState::Polling | PollState::Idle => {
                    self.poll_once(now).await;
                }
                step @ PollState::Sleeping { until } => {
                    self.set_phase(step);
                    if !self.sleep_until(now, until).await {
                        break;
                    }
                }
                step @ PollState::RateLimited { until } => {
                    let remaining = self.feed.quota().map(|q| q.remaining);
                    info!(?remaining, resume_at = %until, "rate limit nearly exhausted, deferring poll");
                    metrics::rate_limited().add(1, &[]);
                    self.set_phase(step);
                    if !self.sleep_until(now, until).await {
                        break;
                    }
                }
            }
        }

        self.set_phase(PollState::Idle);
        info!("poll scheduler stopped");
    }

    /// Sleep until `until`. Returns `false` if cancelled first.
    async fn sleep_until(&self, now: DateTime<Utc>, until: DateTime<Utc>) -> bool {
        let wait = (until - now).to_std().unwrap_or_default();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// Perform one poll attempt that started at `now`, then persist the new
    /// schedule.
    pub async fn poll_once(&mut self, now: DateTime<Utc>) -> PollReport {
        self.attempts += 1;
        self.set_phase(PollState::Polling);
        let span = start_poll_span(self.attempts);
        let started = Instant::now();

        let report = self.attempt(now).instrument(span.clone()).await;

        let next_in = (report.next_poll_time - now).num_seconds().max(0) as u64;
        record_poll_result(
            &span,
            report.outcome.as_str(),
            report.fetched,
            report.inserted,
            next_in,
        );
        metrics::polls().add(1, &[KeyValue::new("outcome", report.outcome.as_str())]);
        metrics::poll_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        if let Err(e) = self.state_file.save(&self.state).await {
            warn!(path = %self.state_file.path().display(), "failed to persist poll state: {e}");
        }

        self.set_phase(PollState::Sleeping {
            until: self.state.next_poll_time,
        });
        report
    }

    async fn attempt(&mut self, now: DateTime<Utc>) -> PollReport {
        let batch = match self.feed.fetch().await {
            Ok(batch) => batch,
            Err(e) => {
                let fallback = self.schedule_next(now, self.failure_interval());
                warn!(retry_in_secs = fallback, "feed poll failed: {e}");
                return PollReport {
                    attempted_at: now,
                    outcome: PollOutcome::Failed(e.to_string()),
                    fetched: 0,
                    unique: 0,
                    inserted: 0,
                    next_poll_time: self.state.next_poll_time,
                };
            }
        };

        let fetched = batch.events.len();
        metrics::events_fetched().add(fetched as u64, &[]);

        let deduped = dedup_batch(batch.events);
        if deduped.dropped > 0 {
            metrics::batch_duplicates().add(deduped.dropped as u64, &[]);
            debug!(dropped = deduped.dropped, "collapsed duplicate ids in batch");
        }
        let unique = deduped.events.len();

        let inserted = if deduped.events.is_empty() {
            0
        } else {
            match self.store.insert(&deduped.events).await {
                Ok(n) => {
                    metrics::events_inserted().add(
                        n,
                        &[KeyValue::new("backend", self.store.backend().to_string())],
                    );
                    n
                }
                Err(e) => {
                    // Health reporting tracks the failure; the poll still counts.
                    warn!(unique, "storing polled events failed: {e}");
                    0
                }
            }
        };

        let mut hint = batch.interval_hint_secs;
        if hint > MAX_POLL_INTERVAL_SECS {
            warn!(
                advertised = hint,
                ceiling = MAX_POLL_INTERVAL_SECS,
                "feed advertised an implausible poll interval, clamping"
            );
            hint = MAX_POLL_INTERVAL_SECS;
        }
        let interval = self.schedule_next(now, hint.max(self.config.min_interval_secs));
        self.state.poll_interval_seconds = interval;
        self.state.last_successful_poll_time = Some(now);

        info!(fetched, unique, inserted, next_in_secs = interval, "poll complete");

        PollReport {
            attempted_at: now,
            outcome: if batch.not_modified {
                PollOutcome::NotModified
            } else {
                PollOutcome::Success
            },
            fetched,
            unique,
            inserted,
            next_poll_time: self.state.next_poll_time,
        }
    }

    fn failure_interval(&self) -> u64 {
        self.config
            .failure_interval_secs
            .max(self.config.min_interval_secs)
    }

    /// Schedule the next poll `interval` seconds after `now`. An
    /// unrepresentable deadline degrades to the failure interval, then to
    /// `now`. Returns the interval actually applied.
    fn schedule_next(&mut self, now: DateTime<Utc>, interval: u64) -> u64 {
        if self.state.reschedule(now, interval) {
            return interval;
        }
        let fallback = self.failure_interval();
        warn!(interval, fallback, "next poll time out of range, using failure interval");
        if self.state.reschedule(now, fallback) {
            fallback
        } else {
            self.state.next_poll_time = now;
            0
        }
    }

    fn set_phase(&mut self, next: PollState) {
        if self.phase.as_str() != next.as_str() {
            record_phase_change(&Span::current(), self.phase.as_str(), next.as_str());
        }
        self.phase = next;
    }
}
