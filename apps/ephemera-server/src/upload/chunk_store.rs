//! Chunk Store
//!
//! Disk staging for chunked uploads. Each upload gets a directory under the
//! staging root holding its chunk files, the `metadata.json` sidecar and an
//! optional `encrypted_sample`. Chunks are written to a `.partial` file while
//! being hashed. A verified [`PartialChunk`] is either promoted into place or
//! discarded by the caller, so the upload session decides whether it lands.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use super::types::{StagedChunk, UploadError, UploadSidecar, MAX_CHUNK_SIZE};

const SIDECAR_FILE: &str = "metadata.json";
const SAMPLE_FILE: &str = "encrypted_sample";
const READ_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Chunk Store
// ============================================================================

/// Staging area for chunked uploads
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Root of all upload directories
    base_path: PathBuf,

    /// Per-chunk size ceiling
    max_chunk_size: u64,
}

impl ChunkStore {
    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_max_chunk_size(base_path, MAX_CHUNK_SIZE)
    }

    pub fn with_max_chunk_size(base_path: PathBuf, max_chunk_size: u64) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                base_path,
                max_chunk_size,
            }),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.inner.max_chunk_size
    }

    fn upload_dir(&self, file_id: Uuid) -> PathBuf {
        self.inner.base_path.join(file_id.to_string())
    }

    fn chunk_path(&self, file_id: Uuid, chunk_index: u32) -> PathBuf {
        self.upload_dir(file_id).join(format!("{:08}.chunk", chunk_index))
    }

    // ========================================================================
    // Chunks
    // ========================================================================

    /// Stream one chunk to a partial file, verifying its SHA-256 digest on
    /// the way. At most `limit` bytes are accepted, never more than the
    /// store's chunk ceiling.
    pub async fn stage_chunk<R: AsyncRead>(
        &self,
        file_id: Uuid,
        chunk_index: u32,
        reader: R,
        expected_hash: &str,
        limit: u64,
    ) -> Result<PartialChunk, UploadError> {
        let dir = self.upload_dir(file_id);
        tokio::fs::create_dir_all(&dir).await?;

        // Unique partial name so concurrent retries of one index cannot collide
        let partial = dir.join(format!(
            "{:08}.{}.partial",
            chunk_index,
            Uuid::new_v4().simple()
        ));

        let limit = limit.min(self.inner.max_chunk_size);
        let written = write_partial(&partial, reader, limit).await;
        let (size, actual_hash) = match written {
            Ok(result) => result,
            Err(e) => {
                remove_quietly(&partial).await;
                return Err(e);
            }
        };

        if !actual_hash.eq_ignore_ascii_case(expected_hash.trim()) {
            remove_quietly(&partial).await;
            tracing::warn!(
                file_id = %file_id,
                chunk_index,
                expected = %expected_hash,
                actual = %actual_hash,
                "Chunk hash mismatch"
            );
            return Err(UploadError::ChunkHashMismatch {
                expected: expected_hash.to_string(),
                actual: actual_hash,
            });
        }

        Ok(PartialChunk {
            path: partial,
            target: self.chunk_path(file_id, chunk_index),
            chunk: StagedChunk {
                index: chunk_index,
                size,
                hash: actual_hash,
            },
        })
    }

    /// Sizes of chunks `0..total_chunks`, failing on the first missing one
    pub async fn chunk_sizes(&self, file_id: Uuid, total_chunks: u32) -> Result<Vec<u64>, UploadError> {
        let mut sizes = Vec::with_capacity(total_chunks as usize);
        for index in 0..total_chunks {
            match tokio::fs::metadata(self.chunk_path(file_id, index)).await {
                Ok(meta) if meta.is_file() => sizes.push(meta.len()),
                Ok(_) => return Err(UploadError::MissingChunk(index)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(UploadError::MissingChunk(index))
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sizes)
    }

    /// Blocking reader over all chunks in index order
    pub fn assembly_reader(&self, file_id: Uuid, total_chunks: u32) -> ChunkChain {
        ChunkChain {
            paths: (0..total_chunks)
                .map(|index| self.chunk_path(file_id, index))
                .collect(),
            current: None,
        }
    }

    // ========================================================================
    // Sidecar and Sample
    // ========================================================================

    pub async fn write_sidecar(&self, file_id: Uuid, sidecar: &UploadSidecar) -> Result<(), UploadError> {
        let dir = self.upload_dir(file_id);
        tokio::fs::create_dir_all(&dir).await?;
        let json = serde_json::to_vec_pretty(sidecar)
            .map_err(|e| UploadError::InternalError(format!("Failed to encode sidecar: {}", e)))?;
        tokio::fs::write(dir.join(SIDECAR_FILE), json).await?;
        Ok(())
    }

    pub async fn read_sidecar(&self, file_id: Uuid) -> Result<UploadSidecar, UploadError> {
        let data = match tokio::fs::read(self.upload_dir(file_id).join(SIDECAR_FILE)).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(UploadError::StagingNotFound(file_id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| UploadError::InternalError(format!("Corrupt upload sidecar: {}", e)))
    }

    pub async fn write_sample(&self, file_id: Uuid, sample: &[u8]) -> Result<(), UploadError> {
        let dir = self.upload_dir(file_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(SAMPLE_FILE), sample).await?;
        Ok(())
    }

    pub async fn read_sample(&self, file_id: Uuid) -> Result<Option<Vec<u8>>, UploadError> {
        match tokio::fs::read(self.upload_dir(file_id).join(SAMPLE_FILE)).await {
            Ok(sample) if sample.is_empty() => Ok(None),
            Ok(sample) => Ok(Some(sample)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    pub async fn has_staging(&self, file_id: Uuid) -> bool {
        tokio::fs::try_exists(self.upload_dir(file_id))
            .await
            .unwrap_or(false)
    }

    /// Remove an upload's staging directory, returning the number of files
    pub async fn delete_staging(&self, file_id: Uuid) -> Result<usize, UploadError> {
        let dir = self.upload_dir(file_id);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            tokio::fs::remove_file(entry.path()).await?;
            count += 1;
        }
        tokio::fs::remove_dir(&dir).await?;

        tracing::debug!(file_id = %file_id, files = count, "Staging directory removed");
        Ok(count)
    }
}

async fn write_partial<R: AsyncRead>(
    path: &Path,
    reader: R,
    limit: u64,
) -> Result<(u64, String), UploadError> {
    tokio::pin!(reader);
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        size += n as u64;
        if size > limit {
            return Err(UploadError::ChunkTooLarge { max: limit });
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n]).await?;
    }

    file.flush().await?;
    Ok((size, hex::encode(hasher.finalize())))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial chunk");
        }
    }
}

// ============================================================================
// Partial Chunk
// ============================================================================

/// A verified chunk still sitting in its `.partial` file
#[derive(Debug)]
pub struct PartialChunk {
    path: PathBuf,
    target: PathBuf,
    chunk: StagedChunk,
}

impl PartialChunk {
    pub fn chunk(&self) -> &StagedChunk {
        &self.chunk
    }

    /// Move the chunk into place as `<index>.chunk`
    pub async fn promote(self) -> Result<StagedChunk, UploadError> {
        if let Err(e) = tokio::fs::rename(&self.path, &self.target).await {
            remove_quietly(&self.path).await;
            return Err(e.into());
        }
        tracing::debug!(
            chunk_index = self.chunk.index,
            size = self.chunk.size,
            "Chunk staged"
        );
        Ok(self.chunk)
    }

    /// Drop the partial file, leaving any staged copy untouched
    pub async fn discard(self) {
        remove_quietly(&self.path).await;
    }
}

// ============================================================================
// Assembly Reader
// ============================================================================

/// Reads chunk files back to back, opening each lazily
pub struct ChunkChain {
    paths: VecDeque<PathBuf>,
    current: Option<File>,
}

impl Read for ChunkChain {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                match self.paths.pop_front() {
                    Some(path) => self.current = Some(File::open(path)?),
                    None => return Ok(0),
                }
            }
            if let Some(file) = self.current.as_mut() {
                let n = file.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
            }
            self.current = None;
        }
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExpiryPolicy;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn stage_and_promote(store: &ChunkStore, file_id: Uuid, index: u32, data: &[u8]) -> StagedChunk {
        store
            .stage_chunk(file_id, index, data, &compute_hash(data), u64::MAX)
            .await
            .unwrap()
            .promote()
            .await
            .unwrap()
    }

    fn staging_entries(temp_dir: &TempDir, file_id: Uuid) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(temp_dir.path().join(file_id.to_string()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_compute_hash() {
        let hash = compute_hash(b"Hello, World!");
        assert_eq!(hash.len(), 64);
    }

    #[tokio::test]
    async fn test_store_and_assemble_out_of_order() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let file_id = Uuid::new_v4();

        let chunks: [&[u8]; 3] = [b"Hello, ", b"chunked ", b"World!"];
        for index in [2u32, 0, 1] {
            let data = chunks[index as usize];
            let staged = stage_and_promote(&store, file_id, index, data).await;
            assert_eq!(staged.size, data.len() as u64);
            assert_eq!(staged.index, index);
        }

        assert_eq!(store.chunk_sizes(file_id, 3).await.unwrap(), vec![7, 8, 6]);

        let mut assembled = Vec::new();
        store
            .assembly_reader(file_id, 3)
            .read_to_end(&mut assembled)
            .unwrap();
        assert_eq!(assembled, b"Hello, chunked World!");
    }

    #[tokio::test]
    async fn test_hash_mismatch_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let file_id = Uuid::new_v4();

        let result = store
            .stage_chunk(file_id, 0, &b"test data"[..], &compute_hash(b"other data"), u64::MAX)
            .await;
        assert!(matches!(result, Err(UploadError::ChunkHashMismatch { .. })));
        assert!(matches!(
            store.chunk_sizes(file_id, 1).await,
            Err(UploadError::MissingChunk(0))
        ));

        let mut entries = std::fs::read_dir(temp_dir.path().join(file_id.to_string())).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_uppercase_digest_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let data = b"case";
        let hash = compute_hash(data).to_uppercase();
        assert!(store
            .stage_chunk(Uuid::new_v4(), 0, &data[..], &hash, u64::MAX)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_chunk_size_ceiling() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_max_chunk_size(temp_dir.path().to_path_buf(), 4);
        let data = b"too long";
        let result = store
            .stage_chunk(Uuid::new_v4(), 0, &data[..], &compute_hash(data), u64::MAX)
            .await;
        assert!(matches!(result, Err(UploadError::ChunkTooLarge { max: 4 })));

        // a tighter caller limit wins over the ceiling
        let result = store
            .stage_chunk(Uuid::new_v4(), 0, &b"abc"[..], &compute_hash(b"abc"), 2)
            .await;
        assert!(matches!(result, Err(UploadError::ChunkTooLarge { max: 2 })));
    }

    #[tokio::test]
    async fn test_discarded_partial_keeps_staged_chunk() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let file_id = Uuid::new_v4();

        stage_and_promote(&store, file_id, 1, b"BBBB").await;
        let partial = store
            .stage_chunk(file_id, 1, &b"ZZZZZZZZ"[..], &compute_hash(b"ZZZZZZZZ"), u64::MAX)
            .await
            .unwrap();
        assert_eq!(partial.chunk().size, 8);
        partial.discard().await;

        assert_eq!(staging_entries(&temp_dir, file_id), vec!["00000001.chunk"]);
        let mut staged = Vec::new();
        File::open(temp_dir.path().join(file_id.to_string()).join("00000001.chunk"))
            .unwrap()
            .read_to_end(&mut staged)
            .unwrap();
        assert_eq!(staged, b"BBBB");
    }

    #[tokio::test]
    async fn test_sidecar_sample_and_cleanup() {
        let temp_dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(temp_dir.path().to_path_buf());
        let file_id = Uuid::new_v4();

        let sidecar = UploadSidecar {
            filename: "movie.mkv".to_string(),
            total_chunks: 4,
            file_size: 1000,
            content_type: "video/x-matroska".to_string(),
            is_encrypted: true,
            expiry: ExpiryPolicy::SixHours,
            upload_time: Utc::now(),
        };
        store.write_sidecar(file_id, &sidecar).await.unwrap();
        store.write_sample(file_id, &[9, 9, 9]).await.unwrap();

        assert_eq!(store.read_sidecar(file_id).await.unwrap(), sidecar);
        assert_eq!(store.read_sample(file_id).await.unwrap(), Some(vec![9, 9, 9]));

        assert_eq!(store.delete_staging(file_id).await.unwrap(), 2);
        assert!(!store.has_staging(file_id).await);
        assert!(matches!(
            store.read_sidecar(file_id).await,
            Err(UploadError::StagingNotFound(_))
        ));
        assert_eq!(store.delete_staging(file_id).await.unwrap(), 0);
    }
}
