//! Durable on-disk FIFO used while the message broker is unreachable.
//!
//! Each entry is one JSON file under `<root>/<queue_name>/`, named with a
//! sortable timestamp plus a monotonic sequence number so lexicographic
//! filename order is FIFO order. Writes are synced to disk before success is
//! reported. I/O failures are logged and surfaced as `false`/`None`; the
//! queue itself stays usable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Serialize, Deserialize)]
struct FallbackEntry {
    item: Value,
    queued_at: DateTime<Utc>,
}

/// Persistent per-name FIFO backed by one file per entry.
#[derive(Debug)]
pub struct FallbackQueue {
    name: String,
    dir: PathBuf,
    max_size: usize,
    // Per-queue lock; the counter it guards disambiguates same-microsecond
    // filenames.
    seq: Mutex<u64>,
}

impl FallbackQueue {
    /// Open (creating on demand) the queue directory `<root>/<name>`.
    pub fn new(name: impl Into<String>, root: &Path, max_size: usize) -> Self {
        let name = name.into();
        let dir = root.join(&name);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::error!(queue = %name, error = %e, "failed to create fallback queue directory");
        } else {
            tracing::info!(queue = %name, dir = %dir.display(), max_size, "fallback queue ready");
        }
        Self { name, dir, max_size, seq: Mutex::new(0) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of entries currently on disk.
    pub async fn count(&self) -> usize {
        let _guard = self.seq.lock().await;
        self.sorted_files().await.len()
    }

    /// Append `item`, evicting the oldest entries when the queue is full.
    /// Returns `true` once the entry is durably on disk.
    pub async fn enqueue(&self, item: &Value) -> bool {
        let mut seq = self.seq.lock().await;

        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::error!(queue = %self.name, error = %e, "fallback enqueue failed: no directory");
            return false;
        }

        let files = self.sorted_files().await;
        if files.len() >= self.max_size {
            let excess = files.len() - self.max_size + 1;
            for path in files.iter().take(excess) {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::error!(queue = %self.name, error = %e, "failed to evict oldest entry");
                } else {
                    tracing::warn!(
                        queue = %self.name,
                        file = %path.display(),
                        "fallback queue full, dropped oldest entry"
                    );
                }
            }
        }

        *seq += 1;
        let now = Utc::now();
        let filename = format!("{}_{:06}.json", now.format("%Y%m%d_%H%M%S_%6f"), *seq);
        let path = self.dir.join(filename);

        let entry = FallbackEntry { item: item.clone(), queued_at: now };
        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(queue = %self.name, error = %e, "failed to encode fallback entry");
                return false;
            }
        };

        match self.write_durable(&path, &bytes).await {
            Ok(()) => {
                tracing::debug!(queue = %self.name, file = %path.display(), "fallback entry stored");
                true
            }
            Err(e) => {
                tracing::error!(queue = %self.name, error = %e, "failed to write fallback entry");
                let _ = tokio::fs::remove_file(&path).await;
                false
            }
        }
    }

    /// Remove and return the oldest entry's item, or `None` when empty.
    pub async fn dequeue(&self) -> Option<Value> {
        let _guard = self.seq.lock().await;

        let files = self.sorted_files().await;
        let oldest = files.first()?;

        let item = match self.read_entry(oldest).await {
            Ok(entry) => Some(entry.item),
            Err(e) => {
                // An undecodable head would jam the queue forever; drop it so
                // the entries behind it stay reachable.
                tracing::error!(
                    queue = %self.name,
                    file = %oldest.display(),
                    error = %e,
                    "discarding undecodable fallback entry"
                );
                None
            }
        };

        if let Err(e) = tokio::fs::remove_file(oldest).await {
            tracing::error!(queue = %self.name, error = %e, "failed to remove dequeued entry");
        }
        item
    }

    /// Read up to `limit` items oldest-first without removing them.
    /// Malformed entries are skipped.
    pub async fn peek(&self, limit: usize) -> Vec<Value> {
        let _guard = self.seq.lock().await;

        let mut items = Vec::new();
        for path in self.sorted_files().await.into_iter().take(limit) {
            match self.read_entry(&path).await {
                Ok(entry) => items.push(entry.item),
                Err(e) => {
                    tracing::warn!(
                        queue = %self.name,
                        file = %path.display(),
                        error = %e,
                        "skipping unreadable entry during peek"
                    );
                }
            }
        }
        items
    }

    async fn write_durable(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }

    async fn read_entry(&self, path: &Path) -> Result<FallbackEntry, String> {
        let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    }

    async fn sorted_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(queue = %self.name, error = %e, "failed to list fallback queue");
                return files;
            }
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        files
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn enqueue_then_dequeue_is_fifo() {
        let root = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new("detection_queue", root.path(), 100);

        assert!(queue.enqueue(&json!({"id": 1})).await);
        assert!(queue.enqueue(&json!({"id": 2})).await);
        assert!(queue.enqueue(&json!({"id": 3})).await);
        assert_eq!(queue.count().await, 3);

        assert_eq!(queue.dequeue().await, Some(json!({"id": 1})));
        assert_eq!(queue.dequeue().await, Some(json!({"id": 2})));
        assert_eq!(queue.dequeue().await, Some(json!({"id": 3})));
        assert_eq!(queue.dequeue().await, None);
        assert_eq!(queue.count().await, 0);
    }

    #[tokio::test]
    async fn entries_are_json_files_with_item_and_queued_at() {
        let root = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new("detection_queue", root.path(), 100);
        assert!(queue.enqueue(&json!({"x": 1})).await);

        let dir = root.path().join("detection_queue");
        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().map(|e| e.unwrap().path()).collect();
        assert_eq!(files.len(), 1);

        let raw: Value =
            serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
        assert_eq!(raw["item"], json!({"x": 1}));
        assert!(raw["queued_at"].is_string());
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_to_make_room() {
        let root = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new("analysis_queue", root.path(), 3);

        for i in 0..4 {
            assert!(queue.enqueue(&json!({"id": i})).await);
        }

        assert_eq!(queue.count().await, 3);
        // Entry 0 was evicted; FIFO resumes at entry 1.
        assert_eq!(queue.dequeue().await, Some(json!({"id": 1})));
    }

    #[tokio::test]
    async fn peek_is_non_destructive_and_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new("detection_queue", root.path(), 100);
        queue.enqueue(&json!({"id": 1})).await;
        queue.enqueue(&json!({"id": 2})).await;

        let first = queue.peek(10).await;
        let second = queue.peek(10).await;
        assert_eq!(first, vec![json!({"id": 1}), json!({"id": 2})]);
        assert_eq!(first, second);
        assert_eq!(queue.count().await, 2);
    }

    #[tokio::test]
    async fn peek_skips_malformed_entries() {
        let root = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new("detection_queue", root.path(), 100);
        queue.enqueue(&json!({"id": 1})).await;

        let dir = root.path().join("detection_queue");
        std::fs::write(dir.join("00000000_000000_000000_000000.json"), b"not json").unwrap();

        let items = queue.peek(10).await;
        assert_eq!(items, vec![json!({"id": 1})]);
    }

    #[tokio::test]
    async fn undecodable_head_is_discarded_not_jamming() {
        let root = tempfile::tempdir().unwrap();
        let queue = FallbackQueue::new("detection_queue", root.path(), 100);

        let dir = root.path().join("detection_queue");
        std::fs::write(dir.join("00000000_000000_000000_000000.json"), b"garbage").unwrap();
        queue.enqueue(&json!({"id": 7})).await;

        assert_eq!(queue.dequeue().await, None);
        assert_eq!(queue.dequeue().await, Some(json!({"id": 7})));
    }
}
