//! Snapshot chunks and the reader that serves a snapshot as chunks

use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{Result, SnapshotError, SnapshotId};

/// One block of one snapshot file, as sent over the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChunk {
    /// String form of the snapshot id
    pub snapshot_id: String,

    /// Name of the file this block belongs to
    pub chunk_name: String,

    /// Number of chunks making up the whole snapshot
    pub total_count: u32,

    /// CRC32 of `content`
    pub checksum: u32,

    pub content: Vec<u8>,

    /// Offset of `content` within the file
    pub file_block_position: u64,

    pub total_file_size: u64,
}

impl SnapshotChunk {
    /// Checksum computed over the carried content
    pub fn computed_checksum(&self) -> u32 {
        crc32fast::hash(&self.content)
    }
}

/// Reject names that could escape the snapshot directory
pub fn validate_chunk_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(SnapshotError::InvalidChunk(format!("invalid chunk name '{}'", name)));
    }
    Ok(())
}

/// Regular files of a snapshot directory with their sizes, sorted by name
pub(crate) async fn list_files(directory: &Path) -> Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(directory).await?;

    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        files.push((name, metadata.len()));
    }

    files.sort();
    Ok(files)
}

#[derive(Debug, Clone)]
struct Block {
    file: String,
    offset: u64,
    len: u64,
    file_size: u64,
}

/// Reads a snapshot directory as an ordered sequence of chunks.
///
/// Files are visited in name order and split into blocks of at most
/// `max_chunk_size` bytes; an empty file still yields one empty chunk.
#[derive(Debug)]
pub struct SnapshotChunkReader {
    snapshot_id: String,
    directory: PathBuf,
    blocks: Vec<Block>,
    next: usize,
}

impl SnapshotChunkReader {
    pub async fn open(id: &SnapshotId, directory: &Path, max_chunk_size: usize) -> Result<Self> {
        if max_chunk_size == 0 {
            return Err(SnapshotError::IllegalState(
                "max chunk size must be greater than 0".to_string(),
            ));
        }

        let max = max_chunk_size as u64;
        let mut blocks = Vec::new();
        for (file, file_size) in list_files(directory).await? {
            let mut offset = 0;
            loop {
                let len = (file_size - offset).min(max);
                blocks.push(Block { file: file.clone(), offset, len, file_size });
                offset += len;
                if offset >= file_size {
                    break;
                }
            }
        }

        Ok(Self {
            snapshot_id: id.to_string(),
            directory: directory.to_path_buf(),
            blocks,
            next: 0,
        })
    }

    pub fn total_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn has_next(&self) -> bool {
        self.next < self.blocks.len()
    }

    pub async fn next_chunk(&mut self) -> Result<Option<SnapshotChunk>> {
        let chunk = self.chunk_at(self.next).await?;
        if chunk.is_some() {
            self.next += 1;
        }
        Ok(chunk)
    }

    /// Read only the block at `index`, without touching the ones before it
    pub async fn chunk_at(&self, index: usize) -> Result<Option<SnapshotChunk>> {
        let Some(block) = self.blocks.get(index) else {
            return Ok(None);
        };

        let mut file = tokio::fs::File::open(self.directory.join(&block.file)).await?;
        file.seek(SeekFrom::Start(block.offset)).await?;
        let mut content = vec![0; block.len as usize];
        file.read_exact(&mut content).await?;

        Ok(Some(SnapshotChunk {
            snapshot_id: self.snapshot_id.clone(),
            chunk_name: block.file.clone(),
            total_count: self.total_count(),
            checksum: crc32fast::hash(&content),
            content,
            file_block_position: block.offset,
            total_file_size: block.file_size,
        }))
    }
}
