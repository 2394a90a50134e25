//! Upstream feed client.
//!
//! One poll is a paginated `GET` of the public events endpoint followed by a
//! `HEAD` request for the advertised poll interval. Every response updates the
//! last known rate-limit quota, which the scheduler consults before polling.

pub mod archive;
pub mod payload;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::FeedConfig;
use crate::error::{Error, Result};
use crate::model::Event;

pub use archive::RawArchive;

pub const POLL_INTERVAL_HEADER: &str = "x-poll-interval";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Remaining request quota as last reported by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Events from one poll plus the interval to wait before the next.
#[derive(Debug, Clone, Default)]
pub struct FeedBatch {
    pub events: Vec<Event>,
    /// Advertised interval, or the last known / default one when the `HEAD`
    /// request could not supply it.
    pub interval_hint_secs: u64,
    /// The feed answered `304 Not Modified`.
    pub not_modified: bool,
}

/// A source of feed batches the scheduler can drive.
#[async_trait]
pub trait FeedSource: Send {
    /// Fetch one batch. An error fails the whole poll attempt.
    async fn fetch(&mut self) -> Result<FeedBatch>;

    /// Quota reported by the most recent response, if any.
    fn quota(&self) -> Option<RateQuota>;
}

/// HTTP client for the GitHub public events feed.
pub struct FeedClient {
    http: reqwest::Client,
    config: FeedConfig,
    default_interval_secs: u64,
    etag: Option<String>,
    last_hint_secs: Option<u64>,
    quota: Option<RateQuota>,
    archive: Option<RawArchive>,
}

impl FeedClient {
    /// Build a client. `default_interval_secs` is the hint used until the
    /// feed advertises one.
    pub fn new(config: FeedConfig, default_interval_secs: u64) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(ref token) = config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|_| Error::Config("GITHUB_TOKEN contains invalid characters".into()))?;
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        let archive = config
            .persist_raw_events
            .then(|| RawArchive::new(config.raw_events_dir.clone()));

        Ok(Self {
            http,
            config,
            default_interval_secs,
            etag: None,
            last_hint_secs: None,
            quota: None,
            archive,
        })
    }

    fn observe_quota(&mut self, headers: &HeaderMap) {
        if let Some(quota) = parse_quota(headers) {
            self.quota = Some(quota);
        }
    }

    /// Primary fetch: up to `max_pages` pages, stopping on a short page.
    async fn fetch_pages(&mut self) -> Result<(Vec<Event>, bool)> {
        let fetched_at = Utc::now();
        let mut events = Vec::new();
        let mut new_etag = None;

        for page in 1..=self.config.max_pages {
            let mut request = self.http.get(&self.config.url).query(&[
                ("per_page", self.config.per_page),
                ("page", page),
            ]);
            if page == 1 {
                if let Some(ref etag) = self.etag {
                    request = request.header(header::IF_NONE_MATCH, etag);
                }
            }

            let response = request.send().await?;
            self.observe_quota(response.headers());

            let status = response.status();
            if status == StatusCode::NOT_MODIFIED {
                debug!("feed not modified since last poll");
                return Ok((Vec::new(), true));
            }
            if !status.is_success() {
                return Err(Error::FeedStatus {
                    status: status.as_u16(),
                    url: response.url().to_string(),
                });
            }
            if page == 1 {
                new_etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
            }

            let body = response.bytes().await?;
            if let Some(ref archive) = self.archive {
                if let Err(e) = archive.write_page(fetched_at, page, &body).await {
                    warn!(page, dir = %archive.dir().display(), "failed to archive raw page: {e}");
                }
            }

            let parsed = payload::parse_page(&body, fetched_at)?;
            debug!(
                page,
                raw = parsed.raw_count,
                kept = parsed.events.len(),
                skipped = parsed.skipped,
                "feed page fetched"
            );
            let short_page = parsed.raw_count < self.config.per_page as usize;
            events.extend(parsed.events);
            if short_page {
                break;
            }
        }

        // Only take the validator once every page made it, otherwise a 304
        // next time would hide the pages we missed. A response without one
        // drops the stale validator.
        self.etag = new_etag;
        Ok((events, false))
    }

    /// Lightweight `HEAD` for the advertised poll interval.
    async fn head_interval(&mut self) -> Result<Option<u64>> {
        let response = self.http.head(&self.config.url).send().await?;
        self.observe_quota(response.headers());
        Ok(parse_poll_interval(response.headers()))
    }
}

#[async_trait]
impl FeedSource for FeedClient {
    async fn fetch(&mut self) -> Result<FeedBatch> {
        let (events, not_modified) = self.fetch_pages().await?;

        let interval_hint_secs = match self.head_interval().await {
            Ok(Some(hint)) => {
                self.last_hint_secs = Some(hint);
                hint
            }
            Ok(None) => self.last_hint_secs.unwrap_or(self.default_interval_secs),
            Err(e) => {
                warn!("poll interval request failed, keeping previous interval: {e}");
                self.last_hint_secs.unwrap_or(self.default_interval_secs)
            }
        };

        Ok(FeedBatch {
            events,
            interval_hint_secs,
            not_modified,
        })
    }

    fn quota(&self) -> Option<RateQuota> {
        self.quota
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// `X-Poll-Interval`, in seconds.
pub fn parse_poll_interval(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, POLL_INTERVAL_HEADER).filter(|&secs| secs > 0)
}

/// `X-RateLimit-Remaining` and `X-RateLimit-Reset` (epoch seconds). Both must
/// be present.
pub fn parse_quota(headers: &HeaderMap) -> Option<RateQuota> {
    let remaining = header_u64(headers, RATE_LIMIT_REMAINING_HEADER)?;
    let reset = header_u64(headers, RATE_LIMIT_RESET_HEADER)?;
    let reset_at = Utc
        .timestamp_opt(i64::try_from(reset).ok()?, 0)
        .single()?;
    Some(RateQuota {
        remaining: u32::try_from(remaining).unwrap_or(u32::MAX),
        reset_at,
    })
}
