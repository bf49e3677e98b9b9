//! Snapshot store: persisted snapshots and staging of new ones

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::chunk::list_files;
use super::{ReceivedSnapshot, Result, SnapshotChunk, SnapshotChunkReader, SnapshotError, SnapshotId};
use quorum_core::{LogIndex, Position, Term};

const SNAPSHOTS_DIRECTORY: &str = "snapshots";
const PENDING_DIRECTORY: &str = "pending";
const CHECKSUM_EXTENSION: &str = "checksum";

/// Per-file checksums of a persisted snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub files: BTreeMap<String, u32>,

    /// CRC32 over every file name and checksum, in name order
    pub combined: u32,
}

impl SnapshotManifest {
    fn from_files(files: BTreeMap<String, u32>) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        for (name, checksum) in &files {
            hasher.update(name.as_bytes());
            hasher.update(&checksum.to_le_bytes());
        }
        Self { files, combined: hasher.finalize() }
    }

    /// Checksum every regular file in `directory`
    pub async fn compute(directory: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        for (name, _) in list_files(directory).await? {
            let content = tokio::fs::read(directory.join(&name)).await?;
            files.insert(name, crc32fast::hash(&content));
        }
        Ok(Self::from_files(files))
    }

    async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        bincode::deserialize(&bytes).map_err(|e| SnapshotError::Encoding(e.to_string()))
    }

    async fn write(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self).map_err(|e| SnapshotError::Encoding(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// An immutable snapshot on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedSnapshot {
    id: SnapshotId,
    directory: PathBuf,
    checksum_path: PathBuf,
    manifest: SnapshotManifest,
}

impl PersistedSnapshot {
    async fn load(id: SnapshotId, directory: PathBuf, checksum_path: PathBuf) -> Result<Self> {
        let manifest = SnapshotManifest::load(&checksum_path).await?;
        Ok(Self { id, directory, checksum_path, manifest })
    }

    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn index(&self) -> LogIndex {
        self.id.index
    }

    pub fn term(&self) -> Term {
        self.id.term
    }

    pub fn processed_position(&self) -> Position {
        self.id.processed_position
    }

    pub fn exporter_position(&self) -> Position {
        self.id.exporter_position
    }

    pub fn path(&self) -> &Path {
        &self.directory
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.manifest.files.keys().map(String::as_str)
    }

    /// Recompute the checksum of every file and compare with the manifest
    pub async fn verify(&self) -> Result<()> {
        let actual = SnapshotManifest::compute(&self.directory).await?;

        for (name, expected) in &self.manifest.files {
            match actual.files.get(name) {
                Some(checksum) if checksum == expected => {}
                Some(checksum) => {
                    return Err(self.corrupted(format!(
                        "file {} has checksum {:#010x}, expected {:#010x}",
                        name, checksum, expected
                    )));
                }
                None => return Err(self.corrupted(format!("file {} is missing", name))),
            }
        }
        if let Some(extra) = actual.files.keys().find(|name| !self.manifest.files.contains_key(*name)) {
            return Err(self.corrupted(format!("unexpected file {}", extra)));
        }
        if actual.combined != self.manifest.combined {
            return Err(self.corrupted("combined checksum mismatch".to_string()));
        }
        Ok(())
    }

    fn corrupted(&self, reason: String) -> SnapshotError {
        SnapshotError::Corrupted { id: self.id.to_string(), reason }
    }

    pub async fn chunk_reader(&self, max_chunk_size: usize) -> Result<SnapshotChunkReader> {
        SnapshotChunkReader::open(&self.id, &self.directory, max_chunk_size).await
    }

    /// Number of chunks the snapshot is sent as with the given chunk size
    pub async fn chunk_count(&self, max_chunk_size: usize) -> Result<u32> {
        Ok(self.chunk_reader(max_chunk_size).await?.total_count())
    }

    /// Read every chunk of the snapshot
    pub async fn chunks(&self, max_chunk_size: usize) -> Result<Vec<SnapshotChunk>> {
        let mut reader = self.chunk_reader(max_chunk_size).await?;
        let mut chunks = Vec::with_capacity(reader.total_count() as usize);
        while let Some(chunk) = reader.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

struct StoreInner {
    snapshots_dir: PathBuf,
    pending_dir: PathBuf,
    /// Latest persisted snapshot; also serializes persists
    latest: Mutex<Option<PersistedSnapshot>>,
}

/// Owns the snapshot directories of one partition.
///
/// Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

impl SnapshotStore {
    /// Open the store under `root`, discarding leftover staging directories and
    /// incomplete snapshots
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let snapshots_dir = root.join(SNAPSHOTS_DIRECTORY);
        let pending_dir = root.join(PENDING_DIRECTORY);
        tokio::fs::create_dir_all(&snapshots_dir).await?;

        if tokio::fs::try_exists(&pending_dir).await? {
            debug!("Removing staging directories under {}", pending_dir.display());
            tokio::fs::remove_dir_all(&pending_dir).await?;
        }
        tokio::fs::create_dir_all(&pending_dir).await?;

        let store = Self {
            inner: Arc::new(StoreInner {
                snapshots_dir,
                pending_dir,
                latest: Mutex::new(None),
            }),
        };

        let snapshots = store.scan().await?;
        let latest = snapshots.into_iter().max_by_key(PersistedSnapshot::id);
        if let Some(snapshot) = &latest {
            info!("Opened snapshot store at {} with latest snapshot {}", root.display(), snapshot.id());
        }
        *store.inner.latest.lock().await = latest;

        Ok(store)
    }

    fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.inner.snapshots_dir.join(id.to_string())
    }

    fn checksum_path(&self, id: &SnapshotId) -> PathBuf {
        self.inner.snapshots_dir.join(format!("{}.{}", id, CHECKSUM_EXTENSION))
    }

    fn staging_dir(&self, id: &SnapshotId) -> PathBuf {
        self.inner.pending_dir.join(format!("{}-{}", id, Uuid::new_v4()))
    }

    /// Load every complete snapshot, removing directories without a manifest
    /// and manifests without a directory
    async fn scan(&self) -> Result<Vec<PersistedSnapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.inner.snapshots_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if entry.metadata().await?.is_dir() {
                let Ok(id) = name.parse::<SnapshotId>() else {
                    warn!("Ignoring unknown directory {} in snapshot store", path.display());
                    continue;
                };
                let checksum_path = self.checksum_path(&id);
                if tokio::fs::try_exists(&checksum_path).await? {
                    snapshots.push(PersistedSnapshot::load(id, path, checksum_path).await?);
                } else {
                    warn!("Removing incomplete snapshot {}", id);
                    tokio::fs::remove_dir_all(&path).await?;
                }
            } else if let Some(stem) = name.strip_suffix(&format!(".{}", CHECKSUM_EXTENSION)) {
                let orphaned = match stem.parse::<SnapshotId>() {
                    Ok(id) => !tokio::fs::try_exists(self.snapshot_dir(&id)).await?,
                    Err(_) => true,
                };
                if orphaned {
                    warn!("Removing orphaned checksum file {}", path.display());
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }

        Ok(snapshots)
    }

    /// The most recent persisted snapshot
    pub async fn latest_snapshot(&self) -> Option<PersistedSnapshot> {
        self.inner.latest.lock().await.clone()
    }

    /// Ids of all persisted snapshots, oldest first
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotId>> {
        let _guard = self.inner.latest.lock().await;
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.inner.snapshots_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.metadata().await?.is_dir() {
                continue;
            }
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<SnapshotId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn has_snapshot(&self, id: &SnapshotId) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.snapshot_dir(id)).await?)
    }

    /// Begin a locally taken snapshot
    pub async fn new_transient_snapshot(
        &self,
        index: LogIndex,
        term: Term,
        processed_position: Position,
        exporter_position: Position,
    ) -> Result<TransientSnapshot> {
        let id = SnapshotId::new(index, term, processed_position, exporter_position);
        if self.has_snapshot(&id).await? {
            return Err(SnapshotError::AlreadyExists(id));
        }

        let directory = self.staging_dir(&id);
        tokio::fs::create_dir_all(&directory).await?;
        debug!("Created transient snapshot {} in {}", id, directory.display());

        Ok(TransientSnapshot { store: self.clone(), id, directory, taken: false })
    }

    /// Begin receiving the snapshot `id` from another member
    pub async fn new_received_snapshot(&self, id: &str) -> Result<ReceivedSnapshot> {
        let id: SnapshotId = id.parse()?;
        if self.has_snapshot(&id).await? {
            return Err(SnapshotError::AlreadyExists(id));
        }

        let directory = self.staging_dir(&id);
        tokio::fs::create_dir_all(&directory).await?;
        debug!("Receiving snapshot {} into {}", id, directory.display());

        Ok(ReceivedSnapshot::new(self.clone(), id, directory))
    }

    /// Move a complete staging directory into place.
    ///
    /// If `id` was persisted in the meantime, or a newer snapshot is already
    /// in place, the staging directory is removed and the existing snapshot
    /// returned. Older snapshots are deleted once a newer one is in place.
    pub(crate) async fn persist_staged(&self, id: SnapshotId, staging: &Path) -> Result<PersistedSnapshot> {
        let mut latest = self.inner.latest.lock().await;

        let directory = self.snapshot_dir(&id);
        let checksum_path = self.checksum_path(&id);
        if tokio::fs::try_exists(&directory).await? {
            debug!("Snapshot {} already persisted, removing {}", id, staging.display());
            remove_dir_if_exists(staging).await?;
            return PersistedSnapshot::load(id, directory, checksum_path).await;
        }

        if let Some(current) = latest.as_ref().filter(|current| current.id() > id) {
            debug!("Snapshot {} is older than {}, removing {}", id, current.id(), staging.display());
            remove_dir_if_exists(staging).await?;
            return Ok(current.clone());
        }

        let manifest = SnapshotManifest::compute(staging).await?;
        manifest.write(&checksum_path).await?;
        tokio::fs::rename(staging, &directory).await?;

        let snapshot = PersistedSnapshot { id, directory, checksum_path, manifest };
        info!("Persisted snapshot {} with {} files", id, snapshot.manifest.files.len());

        *latest = Some(snapshot.clone());
        self.delete_older_than(&id).await?;

        Ok(snapshot)
    }

    async fn delete_older_than(&self, id: &SnapshotId) -> Result<()> {
        let mut older = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.inner.snapshots_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Ok(snapshot_id) = entry.file_name().to_string_lossy().parse::<SnapshotId>() {
                if snapshot_id < *id {
                    older.push(snapshot_id);
                }
            }
        }

        for snapshot_id in older {
            debug!("Deleting snapshot {} superseded by {}", snapshot_id, id);
            remove_dir_if_exists(&self.snapshot_dir(&snapshot_id)).await?;
            remove_file_if_exists(&self.checksum_path(&snapshot_id)).await?;
        }
        Ok(())
    }
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// A snapshot being taken locally
pub struct TransientSnapshot {
    store: SnapshotStore,
    id: SnapshotId,
    directory: PathBuf,
    taken: bool,
}

impl TransientSnapshot {
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Let `writer` fill the staging directory.
    ///
    /// On failure the staging directory is emptied and the error returned.
    pub async fn take<F, Fut>(&mut self, writer: F) -> Result<()>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = std::io::Result<()>>,
    {
        if let Err(e) = writer(self.directory.clone()).await {
            warn!("Failed to take snapshot {}: {}", self.id, e);
            remove_dir_if_exists(&self.directory).await?;
            tokio::fs::create_dir_all(&self.directory).await?;
            return Err(e.into());
        }
        self.taken = true;
        Ok(())
    }

    pub async fn persist(self) -> Result<PersistedSnapshot> {
        if !self.taken {
            return Err(SnapshotError::IllegalState(format!(
                "snapshot {} was not taken before persisting",
                self.id
            )));
        }
        self.store.persist_staged(self.id, &self.directory).await
    }

    pub async fn abort(self) -> Result<()> {
        debug!("Aborting transient snapshot {}", self.id);
        remove_dir_if_exists(&self.directory).await
    }
}
