//! Compressed object store
//!
//! Persists [`FileRecord`] metadata and gzip-compressed content on top of the
//! log engine. Every record occupies two keys:
//!
//! - `meta:<id>` - JSON metadata
//! - `content:<id>` - gzip (best compression) content bytes
//!
//! Writes are serialized behind one exclusive lock; reads share it. Content
//! reads copy the compressed bytes out and release the lock before any
//! decompression happens.

use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::log::{LogOptions, LogStats, LogStore, MergeStats, DEFAULT_MAX_SEGMENT_SIZE};
use crate::models::FileRecord;

pub const METADATA_PREFIX: &str = "meta:";
pub const CONTENT_PREFIX: &str = "content:";

/// Headroom above the upload limit for gzip framing of incompressible data
const VALUE_SIZE_OVERHEAD: u64 = 1024 * 1024;

/// Decompressing reader over one record's content
pub type ContentStream = GzDecoder<Cursor<Vec<u8>>>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub max_upload_size: u64,
    pub sync_writes: bool,
    pub max_segment_size: u64,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>, max_upload_size: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            max_upload_size,
            sync_writes: true,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
        }
    }
}

fn metadata_key(id: &Uuid) -> String {
    format!("{}{}", METADATA_PREFIX, id)
}

fn content_key(id: &Uuid) -> String {
    format!("{}{}", CONTENT_PREFIX, id)
}

/// Gzip the whole stream into memory. Returns the compressed bytes and the
/// number of bytes read from `reader`.
fn compress(reader: &mut dyn Read) -> StoreResult<(Vec<u8>, u64)> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    let consumed = io::copy(reader, &mut encoder)?;
    let compressed = encoder
        .finish()
        .map_err(|e| StoreError::Compression(format!("failed to finish gzip stream: {}", e)))?;
    Ok((compressed, consumed))
}

// ============================================================================
// Object Store
// ============================================================================

/// Handle to the object store, cheap to clone
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<ObjectStoreInner>,
}

struct ObjectStoreInner {
    engine: RwLock<LogStore>,
    data_dir: PathBuf,
}

impl ObjectStore {
    /// Open the store. Failures here are fatal for the process.
    pub fn open(config: &StoreConfig) -> StoreResult<Self> {
        let max_value_size = config
            .max_upload_size
            .checked_add(VALUE_SIZE_OVERHEAD)
            .ok_or_else(|| {
                StoreError::Config(format!(
                    "max upload size {} overflows the value size limit",
                    config.max_upload_size
                ))
            })?;
        let max_value_size = u32::try_from(max_value_size)
            .ok()
            .filter(|size| *size < u32::MAX)
            .ok_or_else(|| {
                StoreError::Config(format!(
                    "max value size {} does not fit the record length field",
                    max_value_size
                ))
            })?;

        let engine = LogStore::open(
            &config.data_dir,
            LogOptions {
                max_value_size,
                max_segment_size: config.max_segment_size,
                sync_writes: config.sync_writes,
            },
        )?;

        tracing::info!(
            path = %config.data_dir.display(),
            records = engine.keys_with_prefix(METADATA_PREFIX).len(),
            max_value_size,
            "Object store opened"
        );

        Ok(Self {
            inner: Arc::new(ObjectStoreInner {
                engine: RwLock::new(engine),
                data_dir: config.data_dir.clone(),
            }),
        })
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.inner.data_dir
    }

    /// Store a record and, optionally, its content.
    ///
    /// When content is given, `record.size` is set to the number of bytes
    /// actually read from it. Compression runs before the write lock is
    /// taken. If the content write fails the metadata key is removed again.
    pub fn put(&self, record: &mut FileRecord, content: Option<&mut dyn Read>) -> StoreResult<()> {
        if record.id.is_nil() {
            record.id = Uuid::new_v4();
        }

        let compressed = content.map(compress).transpose()?;
        if let Some((_, original_size)) = &compressed {
            record.size = *original_size;
        }
        let metadata = serde_json::to_vec(&*record)?;

        let meta_key = metadata_key(&record.id);
        let mut engine = self.inner.engine.write();
        engine.put(&meta_key, &metadata)?;

        if let Some((bytes, original_size)) = compressed {
            if let Err(e) = engine.put(&content_key(&record.id), &bytes) {
                if let Err(rollback) = engine.delete(&meta_key) {
                    tracing::error!(
                        file_id = %record.id,
                        error = %rollback,
                        "Failed to roll back metadata after content write failure"
                    );
                }
                return Err(e);
            }
            drop(engine);

            tracing::debug!(
                file_id = %record.id,
                original_size,
                compressed_size = bytes.len(),
                "Stored compressed content"
            );
        }

        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> StoreResult<FileRecord> {
        let data = self
            .inner
            .engine
            .read()
            .get(&metadata_key(id))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Decompressing reader over the stored content
    pub fn content_stream(&self, id: &Uuid) -> StoreResult<ContentStream> {
        let compressed = self
            .inner
            .engine
            .read()
            .get(&content_key(id))?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(GzDecoder::new(Cursor::new(compressed)))
    }

    /// Remove both keys of a record. Absent records are not an error.
    pub fn delete(&self, id: &Uuid) -> StoreResult<()> {
        let mut engine = self.inner.engine.write();
        engine.delete(&metadata_key(id))?;
        engine.delete(&content_key(id))?;
        Ok(())
    }

    /// Ids whose timed expiry is before `now`. Unreadable records are skipped.
    pub fn list_expired(&self, now: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let engine = self.inner.engine.read();
        let mut expired = Vec::new();

        for key in engine.keys_with_prefix(METADATA_PREFIX) {
            let data = match engine.get(&key) {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable metadata");
                    continue;
                }
            };
            match serde_json::from_slice::<FileRecord>(&data) {
                Ok(record) if record.is_expired(now) => expired.push(record.id),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping malformed metadata");
                }
            }
        }

        Ok(expired)
    }

    pub fn reap_expired(&self) -> StoreResult<usize> {
        self.reap_expired_at(Utc::now())
    }

    /// Delete every record expired at `now`, then compact if anything went
    pub fn reap_expired_at(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let expired = self.list_expired(now)?;
        let mut deleted = 0;

        for id in &expired {
            match self.delete(id) {
                Ok(()) => {
                    deleted += 1;
                    tracing::debug!(file_id = %id, "Deleted expired file");
                }
                Err(e) => {
                    tracing::error!(file_id = %id, error = %e, "Failed to delete expired file");
                }
            }
        }

        if deleted > 0 {
            tracing::info!(deleted_count = deleted, "Expired files removed");
            if let Err(e) = self.compact() {
                tracing::error!(error = %e, "Compaction after expiry cleanup failed");
            }
        }

        Ok(deleted)
    }

    /// Merge the log under the exclusive lock
    pub fn compact(&self) -> StoreResult<MergeStats> {
        let stats = self.inner.engine.write().merge()?;
        tracing::info!(
            live_keys = stats.live_keys,
            bytes_before = stats.bytes_before,
            bytes_after = stats.bytes_after,
            segments_removed = stats.segments_removed,
            "Store compacted"
        );
        Ok(stats)
    }

    pub fn stats(&self) -> LogStats {
        self.inner.engine.read().stats()
    }

    /// Flush the active segment to disk
    pub fn close(&self) -> StoreResult<()> {
        self.inner.engine.write().sync()?;
        tracing::info!(path = %self.inner.data_dir.display(), "Object store closed");
        Ok(())
    }

    /// Start the periodic expiry sweep
    pub fn start_cleanup_task(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let store = self.clone();
                        match tokio::task::spawn_blocking(move || store.reap_expired()).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => tracing::error!(error = %e, "Expiry sweep failed"),
                            Err(e) => tracing::error!(error = %e, "Expiry sweep task panicked"),
                        }
                    }
                }
            }

            tracing::debug!("Store cleanup task stopped");
        })
    }
}
