//! Conversion of raw feed pages into [`Event`]s.
//!
//! Shared by the live feed client and the replay producer so both apply the
//! same filtering.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Event, EventType};

/// Outcome of converting one page.
#[derive(Debug, Default)]
pub struct ParsedPage {
    pub events: Vec<Event>,
    /// Entries on the page before any filtering.
    pub raw_count: usize,
    /// Tracked-type entries dropped for missing or malformed fields.
    pub skipped: usize,
}

#[derive(Deserialize)]
struct RawEvent {
    id: RawId,
    #[serde(rename = "type")]
    kind: String,
    repo: RawRepo,
    created_at: DateTime<Utc>,
    #[serde(default)]
    payload: Option<RawPayload>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

#[derive(Deserialize)]
struct RawRepo {
    id: i64,
    name: String,
}

#[derive(Deserialize)]
struct RawPayload {
    #[serde(default)]
    action: Option<String>,
}

/// Parse a page body (a JSON array of feed entries).
///
/// A body that is not an array is malformed. Entries of untracked types are
/// dropped silently; tracked entries that fail to deserialize are skipped.
pub fn parse_page(body: &[u8], ingested_at: DateTime<Utc>) -> Result<ParsedPage> {
    let entries: Vec<serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedPayload(format!("expected an array of events: {e}")))?;
    Ok(convert_entries(entries, ingested_at))
}

pub fn convert_entries(entries: Vec<serde_json::Value>, ingested_at: DateTime<Utc>) -> ParsedPage {
    let mut page = ParsedPage {
        raw_count: entries.len(),
        ..ParsedPage::default()
    };

    for entry in entries {
        let tracked = entry
            .get("type")
            .and_then(|t| t.as_str())
            .and_then(|t| t.parse::<EventType>().ok());
        let Some(event_type) = tracked else {
            continue;
        };

        match serde_json::from_value::<RawEvent>(entry) {
            Ok(raw) => {
                debug_assert_eq!(raw.kind, event_type.as_str());
                page.events.push(Event {
                    id: match raw.id {
                        RawId::Text(s) => s,
                        RawId::Number(n) => n.to_string(),
                    },
                    event_type,
                    repo_name: raw.repo.name,
                    repo_id: raw.repo.id,
                    created_at: raw.created_at,
                    action: raw.payload.and_then(|p| p.action),
                    ingested_at,
                });
            }
            Err(e) => {
                debug!(%event_type, "skipping malformed feed entry: {e}");
                page.skipped += 1;
            }
        }
    }

    page
}
