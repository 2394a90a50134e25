//! Event types.
//!
//! An event is one entry of the upstream feed, narrowed to the three types
//! the pipeline tracks. Identity is the upstream `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event type
// ---------------------------------------------------------------------------

/// The feed event types the pipeline keeps. Everything else is dropped at
/// payload conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventType {
    WatchEvent,
    PullRequestEvent,
    IssuesEvent,
}

impl EventType {
    pub const ALL: [EventType; 3] = [
        EventType::WatchEvent,
        EventType::PullRequestEvent,
        EventType::IssuesEvent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::WatchEvent => "WatchEvent",
            EventType::PullRequestEvent => "PullRequestEvent",
            EventType::IssuesEvent => "IssuesEvent",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WatchEvent" => Ok(EventType::WatchEvent),
            "PullRequestEvent" => Ok(EventType::PullRequestEvent),
            "IssuesEvent" => Ok(EventType::IssuesEvent),
            other => Err(format!("untracked event type: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A feed event as stored by every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Upstream event id. Unique in storage.
    pub id: String,
    pub event_type: EventType,
    pub repo_name: String,
    pub repo_id: i64,
    pub created_at: DateTime<Utc>,
    /// `payload.action` when the upstream event carries one.
    pub action: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        event_type: EventType,
        repo_name: impl Into<String>,
        repo_id: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            event_type,
            repo_name: repo_name.into(),
            repo_id,
            created_at,
            action: None,
            ingested_at: Utc::now(),
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Whether this event marks a newly opened pull request. Only these feed
    /// the pull-request interval metric and its rollup.
    pub fn is_pull_request_opened(&self) -> bool {
        is_pull_request_opened(self.event_type, self.action.as_deref())
    }
}

/// Shared predicate so storage rows and in-memory events qualify identically.
pub fn is_pull_request_opened(event_type: EventType, action: Option<&str>) -> bool {
    event_type == EventType::PullRequestEvent && action == Some(PULL_REQUEST_OPENED)
}

pub const PULL_REQUEST_OPENED: &str = "opened";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips_upstream_names() {
        for ty in EventType::ALL {
            assert_eq!(ty.as_str().parse::<EventType>().unwrap(), ty);
        }
        assert!("PushEvent".parse::<EventType>().is_err());
    }

    #[test]
    fn only_opened_pull_requests_qualify() {
        let now = Utc::now();
        let opened = Event::new("1", EventType::PullRequestEvent, "a/b", 1, now).action("opened");
        let closed = Event::new("2", EventType::PullRequestEvent, "a/b", 1, now).action("closed");
        let issue = Event::new("3", EventType::IssuesEvent, "a/b", 1, now).action("opened");
        assert!(opened.is_pull_request_opened());
        assert!(!closed.is_pull_request_opened());
        assert!(!issue.is_pull_request_opened());
    }
}
