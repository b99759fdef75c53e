//! Durable pending-event store.
//!
//! One JSON file per undelivered event, named `<uuid>.json`.  Writes go
//! through a temp file, fsync, and an atomic rename, so a crash at any
//! point leaves either the complete record or nothing -- never a torn
//! file that later replays half an event.
//!
//! All operations serialize on one mutex; the store is shared between the
//! ingest pipeline (writer) and the retry loop (reader/remover).

use acs_protocol::{NormalizedEvent, PendingRecord};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// PendingStore
// ---------------------------------------------------------------------------

/// A pending record together with the file it was loaded from.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub path: PathBuf,
    pub record: PendingRecord,
}

/// The on-disk queue of events awaiting upstream delivery.
pub struct PendingStore {
    dir: PathBuf,
    max_pending_days: u32,
    lock: Mutex<()>,
}

impl PendingStore {
    /// Open the store, creating the directory if needed.
    pub fn open(dir: &Path, max_pending_days: u32) -> Result<PendingStore, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(PendingStore {
            dir: dir.to_owned(),
            max_pending_days,
            lock: Mutex::new(()),
        })
    }

    /// Persist an undelivered event.  Returns the path of the new record.
    pub async fn save(&self, tenant: &str, event: &NormalizedEvent) -> Result<PathBuf, StoreError> {
        let record = PendingRecord {
            pending_id: uuid::Uuid::new_v4(),
            saved_at: chrono::Utc::now().to_rfc3339(),
            tenant: tenant.to_owned(),
            event: event.clone(),
        };
        let json = serde_json::to_vec_pretty(&record)?;

        let final_path = self.dir.join(format!("{}.json", record.pending_id));
        let tmp_path = self.dir.join(format!("{}.json.tmp", record.pending_id));

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path).await?;

        info!(path = %final_path.display(), tenant, "saved pending event");
        Ok(final_path)
    }

    /// Load every readable record.  Unreadable files are skipped with a
    /// warning and left in place for operator inspection.
    pub async fn load_all(&self) -> Vec<StoredEvent> {
        let _guard = self.lock.lock().await;
        let mut loaded = Vec::new();
        let mut paths = match self.list_record_paths().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, dir = %self.dir.display(), "failed to enumerate pending store");
                return loaded;
            }
        };
        paths.sort();

        for path in paths {
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<PendingRecord>(&bytes) {
                    Ok(record) => loaded.push(StoredEvent { path, record }),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable pending record");
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable pending file");
                }
            }
        }
        loaded
    }

    /// Remove a delivered record.
    pub async fn remove(&self, path: &Path) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        tokio::fs::remove_file(path).await?;
        info!(path = %path.display(), "removed pending event");
        Ok(())
    }

    /// Delete records whose file mtime is older than `max_pending_days`.
    /// Returns the number of files removed.
    pub async fn cleanup_old(&self) -> usize {
        let _guard = self.lock.lock().await;
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(u64::from(self.max_pending_days) * 86_400);

        let paths = match self.list_record_paths().await {
            Ok(p) => p,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for path in paths {
            let old = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(mtime) => mtime < cutoff,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cleanup: cannot stat pending file");
                    false
                }
            };
            if old {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        info!(path = %path.display(), "removed expired pending file");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "cleanup failed"),
                }
            }
        }
        removed
    }

    /// Number of queued records (for the metrics snapshot).
    pub async fn pending_count(&self) -> u64 {
        let _guard = self.lock.lock().await;
        match self.list_record_paths().await {
            Ok(paths) => paths.len() as u64,
            Err(_) => 0,
        }
    }

    async fn list_record_paths(&self) -> Result<Vec<PathBuf>, std::io::Error> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        Ok(paths)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
