//! Replaying archived feed pages.

use ghstats_rs::ingest::replay;
use ghstats_rs::storage::{EventStore, MemoryStore};
use serde_json::json;
use tempfile::TempDir;

fn entry(id: &str, kind: &str, repo: &str, created_at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "type": kind,
        "actor": {"id": 1, "login": "octocat"},
        "repo": {"id": 42, "name": repo},
        "payload": {"action": "opened"},
        "created_at": created_at,
    })
}

fn write_page(dir: &TempDir, name: &str, entries: serde_json::Value) {
    std::fs::write(dir.path().join(name), serde_json::to_vec(&entries).unwrap()).unwrap();
}

fn archive() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_page(
        &dir,
        "2026-10-18T10-00-00.json",
        json!([
            entry("1", "PullRequestEvent", "a/b", "2026-10-18T09:59:00Z"),
            entry("1", "PullRequestEvent", "a/b", "2026-10-18T09:58:00Z"),
            entry("2", "PushEvent", "a/b", "2026-10-18T09:59:30Z"),
            entry("3", "WatchEvent", "c/d", "2026-10-18T09:59:40Z"),
        ]),
    );
    write_page(
        &dir,
        "2026-10-18T10-00-00.p2.json",
        json!([entry("3", "WatchEvent", "c/d", "2026-10-18T09:59:40Z")]),
    );
    std::fs::write(dir.path().join("2026-10-18T10-01-00.json"), b"<html>rate limited</html>")
        .unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
    dir
}

#[tokio::test]
async fn replay_inserts_unique_events() {
    let dir = archive();
    let store = MemoryStore::new();

    let stats = replay(dir.path(), &store, false).await.unwrap();

    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.events_found, 3);
    assert_eq!(stats.events_inserted, 2);
    assert_eq!(stats.errors, 1);
    assert_eq!(store.len(), 2);
    assert_eq!(
        store.get("1").unwrap().created_at.to_rfc3339(),
        "2026-10-18T09:58:00+00:00"
    );
}

#[tokio::test]
async fn dry_run_stores_nothing() {
    let dir = archive();
    let store = MemoryStore::new();

    let stats = replay(dir.path(), &store, true).await.unwrap();

    assert_eq!(stats.events_found, 3);
    assert_eq!(stats.events_inserted, 0);
    assert!(store.is_empty());
    assert_eq!(store.health().await.total_events, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn unreadable_entries_are_counted_and_skipped() {
    let dir = archive();
    std::fs::create_dir(dir.path().join("2026-10-18T09-00-00.json")).unwrap();
    std::os::unix::fs::symlink(
        dir.path().join("gone.json"),
        dir.path().join("2026-10-18T09-30-00.json"),
    )
    .unwrap();
    let store = MemoryStore::new();

    let stats = replay(dir.path(), &store, false).await.unwrap();

    assert_eq!(stats.files_processed, 2);
    assert_eq!(stats.events_inserted, 2);
    // The malformed page plus the dangling link; the directory is not a page.
    assert_eq!(stats.errors, 2);
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn missing_directory_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = MemoryStore::new();
    assert!(replay(&dir.path().join("absent"), &store, false).await.is_err());
}
