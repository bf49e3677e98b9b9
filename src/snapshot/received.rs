//! A snapshot being received chunk by chunk from another member

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, trace, warn};

use super::store::remove_dir_if_exists;
use super::{
    validate_chunk_name, PersistedSnapshot, Result, SnapshotChunk, SnapshotError, SnapshotId,
    SnapshotStore,
};

/// Receives chunks into its own staging directory until persisted or aborted.
///
/// Several receivers of the same snapshot may exist at once; each writes to a
/// separate directory and the first to persist wins.
pub struct ReceivedSnapshot {
    store: SnapshotStore,
    id: SnapshotId,
    directory: PathBuf,
    expected_count: Option<u32>,
    applied: HashSet<(String, u64)>,
}

impl ReceivedSnapshot {
    pub(crate) fn new(store: SnapshotStore, id: SnapshotId, directory: PathBuf) -> Self {
        Self {
            store,
            id,
            directory,
            expected_count: None,
            applied: HashSet::new(),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Number of distinct chunks written so far
    pub fn applied_count(&self) -> u32 {
        self.applied.len() as u32
    }

    /// Total chunk count announced by the first accepted chunk
    pub fn expected_count(&self) -> Option<u32> {
        self.expected_count
    }

    /// Validate and write one chunk.
    ///
    /// A chunk that was already applied is accepted without writing it again.
    /// A rejected chunk leaves previously applied chunks untouched.
    pub async fn apply(&mut self, chunk: &SnapshotChunk) -> Result<()> {
        let expected_id = self.id.to_string();
        if chunk.snapshot_id != expected_id {
            return Err(SnapshotError::IdMismatch {
                expected: expected_id,
                actual: chunk.snapshot_id.clone(),
            });
        }

        if let Some(expected) = self.expected_count {
            if chunk.total_count != expected {
                return Err(SnapshotError::TotalCountMismatch {
                    chunk: chunk.chunk_name.clone(),
                    expected,
                    actual: chunk.total_count,
                });
            }
        }

        let computed = chunk.computed_checksum();
        if computed != chunk.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                chunk: chunk.chunk_name.clone(),
                expected: chunk.checksum,
                actual: computed,
            });
        }

        validate_chunk_name(&chunk.chunk_name)?;
        let end = chunk.file_block_position + chunk.content.len() as u64;
        if end > chunk.total_file_size {
            return Err(SnapshotError::InvalidChunk(format!(
                "chunk {} ends at {} beyond file size {}",
                chunk.chunk_name, end, chunk.total_file_size
            )));
        }

        let key = (chunk.chunk_name.clone(), chunk.file_block_position);
        if self.applied.contains(&key) {
            trace!("Ignoring redelivered chunk {}@{} of snapshot {}", key.0, key.1, self.id);
            return Ok(());
        }

        if self.applied.len() as u32 >= chunk.total_count {
            return Err(SnapshotError::InvalidChunk(format!(
                "snapshot {} already has all {} chunks",
                self.id, chunk.total_count
            )));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.directory.join(&chunk.chunk_name))
            .await?;
        file.seek(SeekFrom::Start(chunk.file_block_position)).await?;
        file.write_all(&chunk.content).await?;
        file.flush().await?;

        self.expected_count.get_or_insert(chunk.total_count);
        self.applied.insert(key);
        trace!(
            "Applied chunk {}@{} of snapshot {} ({}/{})",
            chunk.chunk_name,
            chunk.file_block_position,
            self.id,
            self.applied.len(),
            chunk.total_count
        );
        Ok(())
    }

    /// Finalize the snapshot once every chunk is applied.
    ///
    /// If another receiver already persisted the same id, its snapshot is
    /// returned and this staging directory removed.
    pub async fn persist(&mut self) -> Result<PersistedSnapshot> {
        let applied = self.applied_count();
        match self.expected_count {
            Some(expected) if applied == expected => {}
            expected => {
                return Err(SnapshotError::IllegalState(format!(
                    "snapshot {} has {} of {} chunks applied",
                    self.id,
                    applied,
                    expected.map_or_else(|| "unknown".to_string(), |count| count.to_string())
                )));
            }
        }

        debug!("Persisting received snapshot {} with {} chunks", self.id, applied);
        self.store.persist_staged(self.id, &self.directory).await
    }

    /// Discard the staging directory and everything applied to it
    pub async fn abort(&mut self) -> Result<()> {
        if let Err(e) = remove_dir_if_exists(&self.directory).await {
            warn!("Failed to abort received snapshot {}: {}", self.id, e);
            return Err(e);
        }
        debug!("Aborted received snapshot {}", self.id);
        self.applied.clear();
        self.expected_count = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotManifest;
    use tempfile::TempDir;

    /// A persisted source snapshot whose chunks can be fed to receivers
    async fn source_chunks() -> (TempDir, PersistedSnapshot, Vec<SnapshotChunk>) {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).await.unwrap();
        let mut transient = store.new_transient_snapshot(10, 2, 10, 8).await.unwrap();
        transient
            .take(|dir| async move {
                tokio::fs::write(dir.join("records"), b"0123456789abcdef").await?;
                tokio::fs::write(dir.join("state"), b"xyz").await
            })
            .await
            .unwrap();
        let snapshot = transient.persist().await.unwrap();
        let chunks = snapshot.chunks(8).await.unwrap();
        // records: two blocks, state: one
        assert_eq!(chunks.len(), 3);
        (temp_dir, snapshot, chunks)
    }

    async fn receiver_store() -> (TempDir, SnapshotStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(temp_dir.path()).await.unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_receive_all_chunks_and_persist() {
        let (_source_dir, source, chunks) = source_chunks().await;
        let (_dir, store) = receiver_store().await;

        let mut received = store.new_received_snapshot("10-2-10-8").await.unwrap();
        for chunk in &chunks {
            received.apply(chunk).await.unwrap();
        }
        assert_eq!(received.applied_count(), 3);
        assert_eq!(received.expected_count(), Some(3));

        let persisted = received.persist().await.unwrap();
        assert_eq!(persisted.id(), source.id());
        assert_eq!(persisted.manifest(), source.manifest());
        persisted.verify().await.unwrap();
        assert_eq!(store.latest_snapshot().await, Some(persisted));
    }

    #[tokio::test]
    async fn test_redelivered_chunk_is_idempotent() {
        let (_source_dir, _source, chunks) = source_chunks().await;
        let (_dir, store) = receiver_store().await;

        let mut received = store.new_received_snapshot("10-2-10-8").await.unwrap();
        received.apply(&chunks[0]).await.unwrap();
        received.apply(&chunks[0]).await.unwrap();
        received.apply(&chunks[1]).await.unwrap();
        received.apply(&chunks[0]).await.unwrap();
        received.apply(&chunks[2]).await.unwrap();
        assert_eq!(received.applied_count(), 3);

        let persisted = received.persist().await.unwrap();
        let content = tokio::fs::read(persisted.path().join("records")).await.unwrap();
        assert_eq!(content, b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_rejected_chunks_do_not_corrupt_earlier_ones() {
        let (_source_dir, _source, chunks) = source_chunks().await;
        let (_dir, store) = receiver_store().await;
        let mut received = store.new_received_snapshot("10-2-10-8").await.unwrap();
        received.apply(&chunks[0]).await.unwrap();

        let mut wrong_id = chunks[1].clone();
        wrong_id.snapshot_id = "11-2-11-8".to_string();
        assert!(matches!(received.apply(&wrong_id).await, Err(SnapshotError::IdMismatch { .. })));

        let mut wrong_count = chunks[1].clone();
        wrong_count.total_count = 4;
        assert!(matches!(
            received.apply(&wrong_count).await,
            Err(SnapshotError::TotalCountMismatch { expected: 3, actual: 4, .. })
        ));

        let mut corrupted = chunks[1].clone();
        corrupted.content[0] ^= 0xff;
        assert!(matches!(
            received.apply(&corrupted).await,
            Err(SnapshotError::ChecksumMismatch { .. })
        ));

        let mut escaping = chunks[1].clone();
        escaping.chunk_name = "../records".to_string();
        assert!(matches!(received.apply(&escaping).await, Err(SnapshotError::InvalidChunk(_))));

        assert_eq!(received.applied_count(), 1);
        received.apply(&chunks[1]).await.unwrap();
        received.apply(&chunks[2]).await.unwrap();
        let persisted = received.persist().await.unwrap();
        persisted.verify().await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_with_missing_chunk_fails() {
        let (_source_dir, _source, chunks) = source_chunks().await;
        let (_dir, store) = receiver_store().await;
        let mut received = store.new_received_snapshot("10-2-10-8").await.unwrap();
        received.apply(&chunks[0]).await.unwrap();
        received.apply(&chunks[2]).await.unwrap();

        assert!(matches!(received.persist().await, Err(SnapshotError::IllegalState(_))));
        assert!(received.path().exists());
        assert!(store.latest_snapshot().await.is_none());

        received.abort().await.unwrap();
        assert!(!received.path().exists());
    }

    #[tokio::test]
    async fn test_abort_without_chunks() {
        let (_dir, store) = receiver_store().await;
        let mut received = store.new_received_snapshot("1-1-1-1").await.unwrap();

        assert!(matches!(received.persist().await, Err(SnapshotError::IllegalState(_))));
        received.abort().await.unwrap();
        received.abort().await.unwrap();
        assert!(!received.path().exists());
    }

    #[tokio::test]
    async fn test_concurrent_receivers_of_same_snapshot() {
        let (_source_dir, _source, chunks) = source_chunks().await;
        let (_dir, store) = receiver_store().await;

        let mut first = store.new_received_snapshot("10-2-10-8").await.unwrap();
        let mut second = store.new_received_snapshot("10-2-10-8").await.unwrap();
        assert_ne!(first.path(), second.path());

        for chunk in &chunks {
            first.apply(chunk).await.unwrap();
            second.apply(chunk).await.unwrap();
        }

        let persisted_first = first.persist().await.unwrap();
        let persisted_second = second.persist().await.unwrap();

        assert_eq!(persisted_first, persisted_second);
        assert!(!second.path().exists());
        assert_eq!(store.list_snapshots().await.unwrap(), vec![persisted_first.id()]);
    }

    #[tokio::test]
    async fn test_invalid_id_is_rejected() {
        let (_dir, store) = receiver_store().await;
        assert!(matches!(
            store.new_received_snapshot("not-a-snapshot").await,
            Err(SnapshotError::InvalidId(_))
        ));
    }

    #[tokio::test]
    async fn test_manifest_matches_received_content() {
        let (_source_dir, _source, chunks) = source_chunks().await;
        let (_dir, store) = receiver_store().await;
        let mut received = store.new_received_snapshot("10-2-10-8").await.unwrap();
        for chunk in chunks.iter().rev() {
            received.apply(chunk).await.unwrap();
        }

        let manifest = SnapshotManifest::compute(received.path()).await.unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files["state"], crc32fast::hash(b"xyz"));
    }
}
