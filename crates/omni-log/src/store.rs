// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only JSONL event log with a batched background flusher.
//!
//! `append` never blocks the agent turn path and never returns an error:
//! disk failures are counted and swallowed.  An orderly `shutdown` flushes
//! everything; a crash between flushes may lose the last unflushed batch.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// One persisted runtime event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// Wall-clock milliseconds since the epoch.
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventLogEntry {
    pub fn now(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            ts: Utc::now().timestamp_millis(),
            kind: kind.into(),
            subtype: None,
            thread_id: None,
            payload,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }
}

/// What `compact_retention` keeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionPolicy {
    pub retention_days: Option<u32>,
    /// Most recent entries win; the survivors are rewritten in ascending
    /// timestamp order.
    pub max_entries: Option<usize>,
}

struct Inner {
    /// Serialized lines awaiting flush.
    pending: Vec<String>,
    error_count: u64,
}

pub struct EventLogStore {
    path: PathBuf,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    shutdown: Arc<AtomicBool>,
    batch_size: usize,
    flusher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventLogStore {
    /// Open (creating if needed) the log at `path` and start the background
    /// flusher.  Must be called from within a tokio runtime.
    pub fn open(path: impl Into<PathBuf>, batch_size: usize, flush_interval_ms: u64) -> Arc<Self> {
        let path = path.into();
        let inner = Arc::new(Mutex::new(Inner {
            pending: Vec::new(),
            error_count: 0,
        }));
        let notify = Arc::new(Notify::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let store = Arc::new(Self {
            path: path.clone(),
            inner: Arc::clone(&inner),
            notify: Arc::clone(&notify),
            shutdown: Arc::clone(&shutdown),
            batch_size: batch_size.max(1),
            flusher: Mutex::new(None),
        });

        let interval = Duration::from_millis(flush_interval_ms.max(1));
        let task_inner = inner;
        let task_notify = notify;
        let task_shutdown = shutdown;
        let task_path = path;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_notify.notified() => {}
                    _ = tokio::time::sleep(interval) => {}
                }
                flush_pending(&task_path, &task_inner);
                if task_shutdown.load(Ordering::SeqCst) {
                    // One more pass in case an append raced the flag.
                    flush_pending(&task_path, &task_inner);
                    break;
                }
            }
        });
        *store.flusher.lock().expect("flusher lock poisoned") = Some(handle);
        store
    }

    /// Queue one entry.  Never blocks and never fails the caller.
    pub fn append(&self, entry: EventLogEntry) {
        let line = match serde_json::to_string(&entry) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "unserializable event log entry dropped");
                self.inner.lock().expect("log lock poisoned").error_count += 1;
                return;
            }
        };
        let should_flush = {
            let mut inner = self.inner.lock().expect("log lock poisoned");
            inner.pending.push(line);
            inner.pending.len() >= self.batch_size
        };
        if should_flush {
            self.notify.notify_one();
        }
    }

    /// Force a durable write of everything queued so far.
    pub fn flush(&self) {
        flush_pending(&self.path, &self.inner);
    }

    /// Disk/serialization errors swallowed so far.
    pub fn error_count(&self) -> u64 {
        self.inner.lock().expect("log lock poisoned").error_count
    }

    /// Scan the whole log.  Malformed lines are skipped, not fatal: a log
    /// torn by a crash must still replay.
    pub fn read_all(&self) -> Vec<EventLogEntry> {
        self.flush();
        read_entries(&self.path)
    }

    /// Copy the log (flushed) to `dest`.
    pub fn export_jsonl(&self, dest: &Path) -> anyhow::Result<()> {
        self.flush();
        std::fs::copy(&self.path, dest)?;
        Ok(())
    }

    /// Rewrite the log keeping only entries within the retention policy.
    ///
    /// The new file is written beside the log and swapped in atomically;
    /// appends arriving during the rewrite sit in the buffer and land in the
    /// new file on the next flush.
    pub fn compact_retention(&self, now: DateTime<Utc>, policy: RetentionPolicy) -> anyhow::Result<usize> {
        self.flush();
        // Holding the buffer lock pauses flushes for the duration of the swap.
        let guard = self.inner.lock().expect("log lock poisoned");
        let mut entries = read_entries(&self.path);
        if let Some(days) = policy.retention_days {
            let cutoff = now.timestamp_millis() - (days as i64) * 86_400_000;
            entries.retain(|e| e.ts >= cutoff);
        }
        if let Some(max) = policy.max_entries {
            entries.sort_by(|a, b| b.ts.cmp(&a.ts));
            entries.truncate(max);
        }
        entries.sort_by(|a, b| a.ts.cmp(&b.ts));

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            for e in &entries {
                writeln!(f, "{}", serde_json::to_string(e)?)?;
            }
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        drop(guard);
        debug!(kept = entries.len(), "event log retention compaction complete");
        Ok(entries.len())
    }

    /// Stop the flusher and flush any remaining entries.
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        let handle = self.flusher.lock().expect("flusher lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush();
    }
}

fn flush_pending(path: &Path, inner: &Mutex<Inner>) {
    let lines = {
        let mut inner = inner.lock().expect("log lock poisoned");
        if inner.pending.is_empty() {
            return;
        }
        std::mem::take(&mut inner.pending)
    };
    let count = lines.len();
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| {
            for line in &lines {
                writeln!(f, "{line}")?;
            }
            f.flush()
        });
    if let Err(e) = result {
        // Lost entries are counted, never surfaced into the turn path.
        warn!(path = %path.display(), error = %e, dropped = count, "event log flush failed");
        inner.lock().expect("log lock poisoned").error_count += count as u64;
    }
}

fn read_entries(path: &Path) -> Vec<EventLogEntry> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn temp_log(batch: usize) -> (tempfile::TempDir, Arc<EventLogStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = EventLogStore::open(dir.path().join("events.jsonl"), batch, 50);
        (dir, store)
    }

    #[tokio::test]
    async fn append_then_flush_persists_lines() {
        let (_dir, store) = temp_log(64);
        store.append(EventLogEntry::now("status", json!({"message": "hi"})));
        store.append(EventLogEntry::now("result", json!({})));
        store.flush();
        let entries = store.read_all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "status");
    }

    #[tokio::test]
    async fn batch_threshold_triggers_background_flush() {
        let (_dir, store) = temp_log(2);
        store.append(EventLogEntry::now("a", json!({})));
        store.append(EventLogEntry::now("b", json!({})));
        // Give the flusher a moment; the batch threshold woke it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let on_disk = read_entries(&store.path);
        assert_eq!(on_disk.len(), 2);
    }

    #[tokio::test]
    async fn shutdown_loses_nothing() {
        let (_dir, store) = temp_log(1000);
        for i in 0..10 {
            store.append(EventLogEntry::now("e", json!({"i": i})));
        }
        store.shutdown().await;
        assert_eq!(read_entries(&store.path).len(), 10);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_on_read() {
        let (dir, store) = temp_log(64);
        store.append(EventLogEntry::now("ok", json!({})));
        store.flush();
        let path = dir.path().join("events.jsonl");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push_str("{not json\n");
        std::fs::write(&path, text).unwrap();
        store.append(EventLogEntry::now("ok2", json!({})));
        let entries = store.read_all();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn retention_by_max_entries_keeps_most_recent_sorted_ascending() {
        let (_dir, store) = temp_log(64);
        for i in 0..5 {
            store.append(EventLogEntry {
                ts: 1000 + i,
                kind: "e".into(),
                subtype: None,
                thread_id: None,
                payload: json!({"i": i}),
            });
        }
        let kept = store
            .compact_retention(Utc::now(), RetentionPolicy {
                retention_days: None,
                max_entries: Some(2),
            })
            .unwrap();
        assert_eq!(kept, 2);
        let entries = store.read_all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ts, 1003);
        assert_eq!(entries[1].ts, 1004);
    }

    #[tokio::test]
    async fn retention_by_days_drops_old_entries() {
        let (_dir, store) = temp_log(64);
        let now = Utc::now();
        let old_ts = now.timestamp_millis() - 10 * 86_400_000;
        store.append(EventLogEntry {
            ts: old_ts,
            kind: "old".into(),
            subtype: None,
            thread_id: None,
            payload: json!({}),
        });
        store.append(EventLogEntry::now("fresh", json!({})));
        store.compact_retention(now, RetentionPolicy {
            retention_days: Some(7),
            max_entries: None,
        })
        .unwrap();
        let entries = store.read_all();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, "fresh");
    }

    #[tokio::test]
    async fn appends_during_compaction_survive() {
        let (_dir, store) = temp_log(64);
        store.append(EventLogEntry::now("before", json!({})));
        store
            .compact_retention(Utc::now(), RetentionPolicy::default())
            .unwrap();
        store.append(EventLogEntry::now("after", json!({})));
        let entries = store.read_all();
        let kinds: Vec<_> = entries.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["before", "after"]);
    }

    #[tokio::test]
    async fn export_jsonl_copies_flushed_log() {
        let (dir, store) = temp_log(64);
        store.append(EventLogEntry::now("e", json!({})));
        let dest = dir.path().join("export.jsonl");
        store.export_jsonl(&dest).unwrap();
        assert_eq!(read_entries(&dest).len(), 1);
    }

    #[tokio::test]
    async fn disk_errors_count_but_do_not_propagate() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the log path makes every open fail.
        let bad = dir.path().join("is-a-dir");
        std::fs::create_dir(&bad).unwrap();
        let store = EventLogStore::open(&bad, 1, 10);
        store.append(EventLogEntry::now("e", json!({})));
        store.flush();
        assert!(store.error_count() >= 1);
    }
}
