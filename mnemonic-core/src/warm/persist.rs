//! Warm index persistence.
//!
//! Snapshots are written to a sibling temp file, fsynced, then renamed over
//! the target so a crash never leaves a truncated snapshot behind. Saves are
//! requested through a bounded queue drained by one dedicated task; a full
//! queue means a save is already pending, so the request is coalesced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::index::{WarmIndex, WarmSnapshot};
use crate::error::{Error, Result};

/// Read and parse a snapshot file.
pub fn read_snapshot(path: &Path) -> Result<WarmSnapshot> {
    let bytes = std::fs::read(path)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::corrupt_snapshot(format!("{} is empty", path.display())));
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::corrupt_snapshot(format!("{}: {}", path.display(), e)))
}

/// Load a warm index, degrading to an empty one when the snapshot is
/// missing, empty or corrupt.
pub fn load_index(path: &Path, dim: usize, limit: usize) -> WarmIndex {
    if !path.exists() {
        debug!(path = %path.display(), "No warm snapshot found, starting empty");
        return WarmIndex::new(dim, limit);
    }

    match read_snapshot(path) {
        Ok(snapshot) => {
            let index = WarmIndex::from_snapshot(snapshot, dim, limit);
            info!(path = %path.display(), entries = index.len(), "Loaded warm snapshot");
            index
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Warm snapshot unusable, starting empty");
            WarmIndex::new(dim, limit)
        }
    }
}

/// Atomically replace `path` with `bytes`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Capture the index under a read lock, write it with no lock held, then
/// acknowledge the saved inserts. Returns the number of entries written.
pub async fn save_index(index: &RwLock<WarmIndex>, path: &Path) -> Result<usize> {
    let (snapshot, captured_dirty) = index.read().await.capture();
    let entries = snapshot.len();
    let bytes = serde_json::to_vec(&snapshot)?;

    write_atomic(path, &bytes).await?;

    index.write().await.mark_clean(captured_dirty);
    debug!(path = %path.display(), entries, "Saved warm snapshot");
    Ok(entries)
}

enum SnapshotCommand {
    Save,
    Flush(oneshot::Sender<Result<usize>>),
    Stop(oneshot::Sender<Result<usize>>),
}

/// Handle to the dedicated snapshot persistence task.
pub struct SnapshotWriter {
    tx: mpsc::Sender<SnapshotCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
    path: PathBuf,
}

impl SnapshotWriter {
    /// Spawn the persistence task for `index`, writing to `path`.
    pub fn spawn(index: Arc<RwLock<WarmIndex>>, path: PathBuf, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<SnapshotCommand>(capacity.max(1));
        let task_path = path.clone();

        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SnapshotCommand::Save => {
                        if let Err(e) = save_index(&index, &task_path).await {
                            warn!(error = %e, "Scheduled warm snapshot failed");
                        }
                    }
                    SnapshotCommand::Flush(ack) => {
                        let _ = ack.send(save_index(&index, &task_path).await);
                    }
                    SnapshotCommand::Stop(ack) => {
                        let _ = ack.send(save_index(&index, &task_path).await);
                        break;
                    }
                }
            }
            debug!("Warm snapshot task stopped");
        });

        Self {
            tx,
            task: Mutex::new(Some(task)),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Request a background save without waiting for it.
    ///
    /// Returns `false` when the request was coalesced into a pending one or
    /// the task has stopped.
    pub fn schedule(&self) -> bool {
        match self.tx.try_send(SnapshotCommand::Save) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => false,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Snapshot task closed, save request dropped");
                false
            }
        }
    }

    /// Save now and wait for the result.
    pub async fn flush(&self) -> Result<usize> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(SnapshotCommand::Flush(ack_tx))
            .await
            .map_err(|_| Error::Internal("snapshot task is not running".to_string()))?;
        ack_rx
            .await
            .map_err(|_| Error::Internal("snapshot task dropped flush".to_string()))?
    }

    /// Flush pending state and stop the task. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<usize> {
        let Some(task) = self.task.lock().await.take() else {
            return Ok(0);
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let result = match self.tx.send(SnapshotCommand::Stop(ack_tx)).await {
            Ok(()) => ack_rx
                .await
                .map_err(|_| Error::Internal("snapshot task dropped stop".to_string()))
                .and_then(|r| r),
            Err(_) => Err(Error::Internal("snapshot task is not running".to_string())),
        };

        if let Err(e) = task.await {
            warn!(error = %e, "Snapshot task panicked");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryId;

    fn populated(n: usize) -> WarmIndex {
        let mut index = WarmIndex::new(2, 100);
        for i in 0..n {
            index
                .insert(
                    &MemoryId::from_content(&format!("m{}", i)),
                    vec![1.0, i as f32],
                    format!("m{}", i),
                )
                .unwrap();
        }
        index
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warm.json");
        let index = RwLock::new(populated(3));

        let written = save_index(&index, &path).await.unwrap();
        assert_eq!(written, 3);
        assert_eq!(index.read().await.dirty(), 0);
        assert!(!dir.path().join("warm.json.tmp").exists());

        let loaded = load_index(&path, 2, 100);
        assert_eq!(loaded.len(), 3);
        assert!(loaded.contains_memory(&MemoryId::from_content("m1")));
    }

    #[tokio::test]
    async fn test_snapshot_format_is_id_keyed_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warm.json");
        let index = RwLock::new(populated(1));
        save_index(&index, &path).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let (key, entry) = raw.as_object().unwrap().iter().next().unwrap();
        assert!(key.starts_with("vec_"));
        for field in ["memoryId", "vector", "contentPreview", "createdAt"] {
            assert!(entry.get(field).is_some(), "missing {}", field);
        }
    }

    #[test]
    fn test_corrupt_snapshot_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warm.json");

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(read_snapshot(&path), Err(Error::CorruptSnapshot(_))));
        assert!(load_index(&path, 2, 100).is_empty());

        std::fs::write(&path, b"").unwrap();
        assert!(matches!(read_snapshot(&path), Err(Error::CorruptSnapshot(_))));
        assert!(load_index(&path, 2, 100).is_empty());
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_index(&dir.path().join("absent.json"), 2, 100).is_empty());
    }

    #[tokio::test]
    async fn test_writer_flush_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap").join("warm.json");
        let index = Arc::new(RwLock::new(populated(2)));
        let writer = SnapshotWriter::spawn(index.clone(), path.clone(), 4);

        assert_eq!(writer.flush().await.unwrap(), 2);
        assert!(path.exists());

        index
            .write()
            .await
            .insert(&MemoryId::from_content("late"), vec![0.0, 1.0], "late")
            .unwrap();
        assert_eq!(writer.shutdown().await.unwrap(), 3);
        assert_eq!(load_index(&path, 2, 100).len(), 3);

        // Second shutdown is a no-op, later requests are dropped
        assert_eq!(writer.shutdown().await.unwrap(), 0);
        assert!(!writer.schedule());
        assert!(writer.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_scheduled_save_lands_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warm.json");
        let index = Arc::new(RwLock::new(populated(2)));
        let writer = SnapshotWriter::spawn(index.clone(), path.clone(), 1);

        writer.schedule();
        // Flush is queued behind the scheduled save
        writer.flush().await.unwrap();
        assert_eq!(index.read().await.dirty(), 0);
        assert_eq!(load_index(&path, 2, 100).len(), 2);
    }
}
