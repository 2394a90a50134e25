//! Batch-local deduplication, the first of the two dedup tiers.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::model::Event;

/// A batch with unique ids.
#[derive(Debug, Default)]
pub struct DedupedBatch {
    /// One event per id, in first-seen order.
    pub events: Vec<Event>,
    /// Entries collapsed into an earlier occurrence of the same id.
    pub dropped: usize,
}

/// Collapse a batch to one event per id in a single pass.
///
/// For a repeated id the entry with the earliest `created_at` wins; on equal
/// timestamps the first-seen entry is kept. The survivor takes the position
/// of the id's first occurrence.
pub fn dedup_batch(events: Vec<Event>) -> DedupedBatch {
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(events.len());
    let mut out: Vec<Event> = Vec::with_capacity(events.len());
    let mut dropped = 0;

    for event in events {
        match slots.entry(event.id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(out.len());
                out.push(event);
            }
            Entry::Occupied(occupied) => {
                dropped += 1;
                let kept = &mut out[*occupied.get()];
                if event.created_at < kept.created_at {
                    *kept = event;
                }
            }
        }
    }

    DedupedBatch {
        events: out,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use chrono::{DateTime, TimeDelta, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn ev(id: &str, created_at: DateTime<Utc>) -> Event {
        Event::new(id, EventType::WatchEvent, "a/b", 1, created_at)
    }

    #[test]
    fn earliest_created_at_wins() {
        let batch = vec![
            Event::new("e1", EventType::PullRequestEvent, "a/b", 1, t0()).action("opened"),
            ev("e1", t0() - TimeDelta::seconds(5)),
            ev("e2", t0()),
        ];
        let out = dedup_batch(batch);

        assert_eq!(out.events.len(), 2);
        assert_eq!(out.dropped, 1);
        assert_eq!(out.events[0].id, "e1");
        assert_eq!(out.events[0].created_at, t0() - TimeDelta::seconds(5));
        assert_eq!(out.events[1].id, "e2");
    }

    #[test]
    fn later_duplicate_does_not_replace_earlier() {
        let earlier = ev("x", t0());
        let later = Event::new("x", EventType::IssuesEvent, "other/repo", 9, t0() + TimeDelta::seconds(1));
        let out = dedup_batch(vec![earlier.clone(), later]);
        assert_eq!(out.events, vec![earlier]);
    }

    #[test]
    fn ties_keep_first_seen() {
        let first = Event::new("x", EventType::IssuesEvent, "first/repo", 1, t0());
        let second = Event::new("x", EventType::IssuesEvent, "second/repo", 2, t0());
        let out = dedup_batch(vec![first, second]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].repo_name, "first/repo");
    }

    #[test]
    fn one_entry_per_id_with_minimal_timestamp() {
        // Interleaved ids with assorted offsets.
        let offsets = [(1, 30), (2, 10), (1, 5), (3, 0), (2, 20), (1, 50), (3, -10)];
        let batch: Vec<Event> = offsets
            .iter()
            .map(|&(id, off)| ev(&format!("id{id}"), t0() + TimeDelta::seconds(off)))
            .collect();
        let out = dedup_batch(batch.clone());

        assert_eq!(out.events.len(), 3);
        assert_eq!(out.dropped, batch.len() - 3);
        for kept in &out.events {
            let min = batch
                .iter()
                .filter(|e| e.id == kept.id)
                .map(|e| e.created_at)
                .min()
                .unwrap();
            assert_eq!(kept.created_at, min, "id {}", kept.id);
        }
        let ids: Vec<&str> = out.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["id1", "id2", "id3"]);
    }

    #[test]
    fn empty_batch() {
        let out = dedup_batch(Vec::new());
        assert!(out.events.is_empty());
        assert_eq!(out.dropped, 0);
    }
}
