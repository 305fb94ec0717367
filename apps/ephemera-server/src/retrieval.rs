//! File retrieval
//!
//! Resolves stored records, applies expiry on access and streams decompressed
//! content. Records with on-first-view expiry are claimed while being served
//! so that at most one reader ever receives them, and are deleted only after
//! a complete copy.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Expiry, FileRecord};
use crate::store::{ContentStream, ObjectStore, StoreError};

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("File not found: {0}")]
    NotFound(Uuid),

    #[error("File has expired: {0}")]
    Gone(Uuid),

    #[error("Storage error: {0}")]
    Storage(StoreError),

    #[error("Stream error: {0}")]
    Io(#[from] io::Error),
}

impl RetrievalError {
    fn from_store(id: Uuid, error: StoreError) -> Self {
        if error.is_not_found() {
            RetrievalError::NotFound(id)
        } else {
            RetrievalError::Storage(error)
        }
    }
}

// ============================================================================
// File Service
// ============================================================================

#[derive(Clone)]
pub struct FileService {
    inner: Arc<FileServiceInner>,
}

struct FileServiceInner {
    store: ObjectStore,
    /// On-first-view ids currently being served
    claims: Mutex<HashSet<Uuid>>,
}

impl FileService {
    pub fn new(store: ObjectStore) -> Self {
        Self {
            inner: Arc::new(FileServiceInner {
                store,
                claims: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Fetch a live record, deleting it if its time has passed
    pub fn resolve(&self, id: Uuid) -> Result<FileRecord, RetrievalError> {
        self.resolve_at(id, Utc::now())
    }

    pub fn resolve_at(&self, id: Uuid, now: DateTime<Utc>) -> Result<FileRecord, RetrievalError> {
        let record = self
            .inner
            .store
            .get(&id)
            .map_err(|e| RetrievalError::from_store(id, e))?;

        if record.is_expired(now) {
            if let Err(e) = self.inner.store.delete(&id) {
                tracing::error!(file_id = %id, error = %e, "Failed to delete expired file");
            } else {
                tracing::info!(file_id = %id, "Deleted expired file on access");
            }
            return Err(RetrievalError::Gone(id));
        }

        Ok(record)
    }

    /// Open the content of a resolved record.
    ///
    /// On-first-view records are claimed here; a second concurrent caller
    /// gets `NotFound` until the claim is released.
    pub fn open_content(&self, record: FileRecord) -> Result<ContentHandle, RetrievalError> {
        let claim = if record.expiry == Expiry::OnFirstView {
            if !self.inner.claims.lock().insert(record.id) {
                tracing::debug!(file_id = %record.id, "View-once file already being served");
                return Err(RetrievalError::NotFound(record.id));
            }
            Some(ViewClaim {
                id: record.id,
                service: self.clone(),
            })
        } else {
            None
        };

        let stream = self
            .inner
            .store
            .content_stream(&record.id)
            .map_err(|e| RetrievalError::from_store(record.id, e))?;

        Ok(ContentHandle {
            record,
            stream,
            store: self.inner.store.clone(),
            _claim: claim,
        })
    }

    /// Resolve and copy a file's content into `sink`, returning bytes written
    pub fn serve_content<W: Write + ?Sized>(&self, id: Uuid, sink: &mut W) -> Result<u64, RetrievalError> {
        let record = self.resolve(id)?;
        self.open_content(record)?.copy_to(sink)
    }

    /// The encrypted sample of a live, encrypted record
    pub fn serve_sample(&self, id: Uuid) -> Result<Vec<u8>, RetrievalError> {
        let record = self.resolve(id)?;
        match record.encrypted_sample {
            Some(sample) if record.is_encrypted && !sample.is_empty() => Ok(sample),
            _ => Err(RetrievalError::NotFound(id)),
        }
    }
}

/// Releases an on-first-view claim when dropped
struct ViewClaim {
    id: Uuid,
    service: FileService,
}

impl Drop for ViewClaim {
    fn drop(&mut self) {
        self.service.inner.claims.lock().remove(&self.id);
    }
}

// ============================================================================
// Content Handle
// ============================================================================

/// An opened content stream, tied to its record
pub struct ContentHandle {
    record: FileRecord,
    stream: ContentStream,
    store: ObjectStore,
    _claim: Option<ViewClaim>,
}

impl ContentHandle {
    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    /// Copy the decompressed content into `sink`.
    ///
    /// On-first-view records are deleted after a complete copy. A failed copy
    /// keeps the record and releases the claim.
    pub fn copy_to<W: Write + ?Sized>(mut self, sink: &mut W) -> Result<u64, RetrievalError> {
        let copied = io::copy(&mut self.stream, sink)?;
        sink.flush()?;

        if copied != self.record.size {
            tracing::warn!(
                file_id = %self.record.id,
                expected = self.record.size,
                copied,
                "Content length differs from recorded size"
            );
        }

        if self.record.expiry == Expiry::OnFirstView {
            self.store
                .delete(&self.record.id)
                .map_err(RetrievalError::Storage)?;
            tracing::info!(file_id = %self.record.id, "Deleted view-once file after download");
        }

        Ok(copied)
    }
}

// ============================================================================
// Response Helpers
// ============================================================================

/// `Content-Disposition` value for a record
pub fn content_disposition(record: &FileRecord) -> String {
    let kind = if record.is_image() || record.is_video() || record.is_audio() {
        "inline"
    } else {
        "attachment"
    };
    let fallback: String = record
        .filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    if record.filename.is_ascii() {
        return format!("{}; filename=\"{}\"", kind, fallback);
    }

    // RFC 5987 extended value for non-ASCII names
    let encoded: String = record
        .filename
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect();
    format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        kind, fallback, encoded
    )
}
