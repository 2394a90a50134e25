//! Typed configuration from environment variables.
//!
//! Loads once at startup and validates before anything uses it.
//! The feed token and database URL are wrapped in `secrecy::SecretString`
//! so they never reach logs.

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FEED_URL: &str = "https://api.github.com/events";

/// Ceiling for every poll interval and delay, whether configured or
/// advertised by the feed.
pub const MAX_POLL_INTERVAL_SECS: u64 = 86_400;

/// Which storage backend the process runs with. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    Postgres,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Memory => "memory",
            BackendKind::Postgres => "postgres",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(BackendKind::Memory),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            other => Err(Error::Config(format!("unknown storage backend '{other}'"))),
        }
    }
}

/// Upstream feed access.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub token: Option<SecretString>,
    pub max_pages: u32,
    pub per_page: u32,
    pub timeout: Duration,
    pub user_agent: String,
    /// Write every fetched page to `raw_events_dir` before conversion.
    pub persist_raw_events: bool,
    pub raw_events_dir: PathBuf,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            token: None,
            max_pages: 3,
            per_page: 100,
            timeout: Duration::from_secs(10),
            user_agent: concat!("ghstats-rs/", env!("CARGO_PKG_VERSION")).to_string(),
            persist_raw_events: false,
            raw_events_dir: PathBuf::from("downloaded-events"),
        }
    }
}

/// Poll cadence and rate-limit policy.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub state_file: PathBuf,
    /// Floor applied to every computed interval.
    pub min_interval_secs: u64,
    /// Interval used until the feed advertises one.
    pub default_interval_secs: u64,
    /// Interval after a failed poll.
    pub failure_interval_secs: u64,
    /// Defer polling when remaining quota drops below this.
    pub quota_min_remaining: u32,
    /// Added to the quota reset time before polling again.
    pub rate_limit_buffer_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("client-state.json"),
            min_interval_secs: 60,
            default_interval_secs: 60,
            failure_interval_secs: 60,
            quota_min_remaining: 10,
            rate_limit_buffer_secs: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub database_url: Option<SecretString>,
    pub ingest_pool_size: u32,
    pub query_pool_size: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            database_url: None,
            ingest_pool_size: 4,
            query_pool_size: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub feed: FeedConfig,
    pub schedule: ScheduleConfig,
    pub storage: StorageConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup, then validate.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let feed_defaults = FeedConfig::default();
        let feed = FeedConfig {
            url: var("FEED_URL").unwrap_or(feed_defaults.url),
            token: var("GITHUB_TOKEN").map(SecretString::from),
            max_pages: parsed(&var, "FEED_MAX_PAGES", feed_defaults.max_pages)?,
            per_page: feed_defaults.per_page,
            timeout: Duration::from_secs(parsed(
                &var,
                "FETCH_TIMEOUT_SECS",
                feed_defaults.timeout.as_secs(),
            )?),
            user_agent: feed_defaults.user_agent,
            persist_raw_events: flag(&var, "PERSIST_RAW_EVENTS", false)?,
            raw_events_dir: var("RAW_EVENTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(feed_defaults.raw_events_dir),
        };

        let sched_defaults = ScheduleConfig::default();
        let schedule = ScheduleConfig {
            state_file: var("STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(sched_defaults.state_file),
            min_interval_secs: parsed(
                &var,
                "MIN_POLL_INTERVAL_SECS",
                sched_defaults.min_interval_secs,
            )?,
            default_interval_secs: parsed(
                &var,
                "DEFAULT_POLL_INTERVAL_SECS",
                sched_defaults.default_interval_secs,
            )?,
            failure_interval_secs: parsed(
                &var,
                "FAILURE_RETRY_INTERVAL_SECS",
                sched_defaults.failure_interval_secs,
            )?,
            quota_min_remaining: parsed(
                &var,
                "RATE_LIMIT_MIN_REMAINING",
                sched_defaults.quota_min_remaining,
            )?,
            rate_limit_buffer_secs: parsed(
                &var,
                "RATE_LIMIT_BUFFER_SECS",
                sched_defaults.rate_limit_buffer_secs,
            )?,
        };

        let storage_defaults = StorageConfig::default();
        let storage = StorageConfig {
            backend: match var("STORAGE_BACKEND") {
                Some(s) => s.parse()?,
                None => storage_defaults.backend,
            },
            database_url: var("DATABASE_URL").map(SecretString::from),
            ingest_pool_size: parsed(&var, "INGEST_POOL_SIZE", storage_defaults.ingest_pool_size)?,
            query_pool_size: parsed(&var, "QUERY_POOL_SIZE", storage_defaults.query_pool_size)?,
        };

        let config = Self {
            feed,
            schedule,
            storage,
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.feed.max_pages == 0 {
            return Err(Error::Config("FEED_MAX_PAGES must be at least 1".into()));
        }
        if self.feed.timeout.is_zero() {
            return Err(Error::Config("FETCH_TIMEOUT_SECS must be positive".into()));
        }
        if self.schedule.min_interval_secs == 0 {
            return Err(Error::Config("MIN_POLL_INTERVAL_SECS must be positive".into()));
        }
        for (name, secs) in [
            ("MIN_POLL_INTERVAL_SECS", self.schedule.min_interval_secs),
            ("DEFAULT_POLL_INTERVAL_SECS", self.schedule.default_interval_secs),
            ("FAILURE_RETRY_INTERVAL_SECS", self.schedule.failure_interval_secs),
            ("RATE_LIMIT_BUFFER_SECS", self.schedule.rate_limit_buffer_secs),
        ] {
            if secs > MAX_POLL_INTERVAL_SECS {
                return Err(Error::Config(format!(
                    "{name} must not exceed {MAX_POLL_INTERVAL_SECS}"
                )));
            }
        }
        if self.storage.backend == BackendKind::Postgres && self.storage.database_url.is_none() {
            return Err(Error::Config(
                "DATABASE_URL is required when STORAGE_BACKEND=postgres".into(),
            ));
        }
        if self.storage.ingest_pool_size == 0 || self.storage.query_pool_size == 0 {
            return Err(Error::Config("pool sizes must be at least 1".into()));
        }
        Ok(())
    }
}

fn parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} has invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn flag(var: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> Result<bool> {
    match var(name).map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(Error::Config(format!("{name} has invalid value '{v}'"))),
        None => Ok(default),
    }
}
