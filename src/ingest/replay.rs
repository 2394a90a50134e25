//! Replay archived feed pages into storage.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::dedup::dedup_batch;
use crate::error::Result;
use crate::feed::payload::parse_page;
use crate::storage::EventStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub files_processed: usize,
    /// Tracked events after per-file dedup.
    pub events_found: usize,
    pub events_inserted: u64,
    /// Files that could not be read, parsed or stored.
    pub errors: usize,
}

/// Feed every `*.json` page under `dir` through the ingestion path, in file
/// name order. With `dry_run`, pages are parsed and counted but not stored.
///
/// Fails only when `dir` itself cannot be opened. Unreadable entries count
/// as errors and are skipped.
pub async fn replay(dir: &Path, store: &dyn EventStore, dry_run: bool) -> Result<ReplayStats> {
    let (files, unlisted) = json_files(dir).await?;
    info!(dir = %dir.display(), files = files.len(), dry_run, "replaying archived pages");

    let mut stats = ReplayStats {
        errors: unlisted,
        ..ReplayStats::default()
    };
    for path in files {
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) => {
                warn!(path = %path.display(), "cannot read archived page: {e}");
                stats.errors += 1;
                continue;
            }
        };
        let page = match parse_page(&body, Utc::now()) {
            Ok(page) => page,
            Err(e) => {
                warn!(path = %path.display(), "skipping archived page: {e}");
                stats.errors += 1;
                continue;
            }
        };
        stats.files_processed += 1;

        let batch = dedup_batch(page.events);
        stats.events_found += batch.events.len();
        debug!(path = %path.display(), events = batch.events.len(), "parsed archived page");
        if dry_run || batch.events.is_empty() {
            continue;
        }

        match store.insert(&batch.events).await {
            Ok(n) => stats.events_inserted += n,
            Err(e) => {
                warn!(path = %path.display(), "storing replayed events failed: {e}");
                stats.errors += 1;
            }
        }
    }

    info!(
        files = stats.files_processed,
        found = stats.events_found,
        inserted = stats.events_inserted,
        errors = stats.errors,
        "replay finished"
    );
    Ok(stats)
}

/// Candidate page files under `dir`, sorted, plus the number of directory
/// entries that could not be listed.
async fn json_files(dir: &Path) -> Result<(Vec<PathBuf>, usize)> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    let mut unlisted = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), "stopped listing archive: {e}");
                unlisted += 1;
                break;
            }
        };
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        // Anything but a directory is a candidate; the read reports the rest.
        let is_dir = entry.file_type().await.is_ok_and(|kind| kind.is_dir());
        if !is_dir {
            files.push(path);
        }
    }
    files.sort();
    Ok((files, unlisted))
}
