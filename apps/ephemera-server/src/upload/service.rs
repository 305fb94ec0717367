//! Upload Service
//!
//! Drives both upload paths into the object store:
//! - chunked uploads: token checks through the [`SessionManager`], staging
//!   through the [`ChunkStore`], assembly on finalize
//! - single-shot uploads straight from a buffered request body

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::chunk_store::ChunkStore;
use super::session::SessionManager;
use super::types::{
    ChunkAccepted, ChunkCommit, ChunkSubmission, FirstChunkMeta, SingleUpload, TokenBatch,
    UploadError, UploadSidecar, SESSION_SWEEP_INTERVAL_SECS,
};
use super::validation::{detect_mime_from_bytes, sanitize_filename, validate_content_type, SNIFF_LEN};
use crate::models::FileRecord;
use crate::store::ObjectStore;

/// Limits applied to every upload
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub max_upload_size: u64,
    /// Allowed type prefixes, `*` for any
    pub allowed_types: Vec<String>,
}

// ============================================================================
// Upload Service
// ============================================================================

#[derive(Clone)]
pub struct UploadService {
    inner: Arc<UploadServiceInner>,
}

struct UploadServiceInner {
    sessions: SessionManager,
    chunks: ChunkStore,
    store: ObjectStore,
    policy: UploadPolicy,
}

impl UploadService {
    pub fn new(
        sessions: SessionManager,
        chunks: ChunkStore,
        store: ObjectStore,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(UploadServiceInner {
                sessions,
                chunks,
                store,
                policy,
            }),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.inner.chunks
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.inner.policy
    }

    /// Largest chunk accepted: the staging ceiling capped by the upload limit
    pub fn max_chunk_size(&self) -> u64 {
        self.inner
            .chunks
            .max_chunk_size()
            .min(self.inner.policy.max_upload_size)
    }

    // ========================================================================
    // Chunked Uploads
    // ========================================================================

    /// Accept one chunk of a chunked upload
    pub async fn submit_chunk<R: AsyncRead>(
        &self,
        submission: ChunkSubmission,
        body: R,
    ) -> Result<ChunkAccepted, UploadError> {
        let ChunkSubmission {
            file_id,
            chunk_index,
            total_chunks,
            file_size,
            chunk_hash,
            token,
            first,
        } = submission;

        if total_chunks == 0 || chunk_index >= total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index: chunk_index,
                total: total_chunks,
            });
        }
        let max = self.inner.policy.max_upload_size;
        if file_size > max {
            return Err(UploadError::FileTooLarge { size: file_size, max });
        }
        // Every chunk carries at least one byte, except the lone chunk of an empty file
        let fits = u64::from(total_chunks) <= file_size.max(1)
            && u64::from(total_chunks).saturating_mul(self.max_chunk_size()) >= file_size;
        if !fits {
            return Err(UploadError::InvalidRequest(format!(
                "{} chunks cannot hold {} bytes",
                total_chunks, file_size
            )));
        }

        let (next_tokens, chunk_size) = if chunk_index == 0 {
            let meta = first.ok_or_else(|| {
                UploadError::InvalidRequest("chunk 0 must carry file metadata".to_string())
            })?;
            self.accept_first_chunk(file_id, total_chunks, file_size, &chunk_hash, meta, body)
                .await?
        } else {
            let token = token
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .ok_or(UploadError::InvalidToken(file_id))?;
            let next_tokens = self
                .inner
                .sessions
                .authorize(file_id, chunk_index, total_chunks, token)?;
            let chunk_size = self.stage_chunk(file_id, chunk_index, &chunk_hash, body).await?;
            (next_tokens, chunk_size)
        };

        tracing::debug!(
            file_id = %file_id,
            chunk_index,
            total_chunks,
            chunk_size,
            "Chunk accepted"
        );

        Ok(ChunkAccepted {
            status: "success".to_string(),
            file_id,
            chunk_index,
            chunk_size,
            next_tokens,
        })
    }

    async fn accept_first_chunk<R: AsyncRead>(
        &self,
        file_id: Uuid,
        total_chunks: u32,
        file_size: u64,
        chunk_hash: &str,
        meta: FirstChunkMeta,
        body: R,
    ) -> Result<(TokenBatch, u64), UploadError> {
        if self.record_exists(file_id).await? {
            return Err(UploadError::AlreadyExists(file_id));
        }
        if !meta.content_type.trim().is_empty() {
            validate_content_type(&meta.content_type, &self.inner.policy.allowed_types)?;
        }

        let tokens = self.inner.sessions.begin(file_id, total_chunks, file_size)?;

        let staged = self
            .stage_first_chunk(file_id, total_chunks, file_size, chunk_hash, meta, body)
            .await;
        match staged {
            Ok(size) => {
                tracing::info!(file_id = %file_id, total_chunks, file_size, "Chunked upload started");
                Ok((tokens, size))
            }
            Err(e) => {
                self.inner.sessions.discard(file_id);
                Err(e)
            }
        }
    }

    async fn stage_first_chunk<R: AsyncRead>(
        &self,
        file_id: Uuid,
        total_chunks: u32,
        file_size: u64,
        chunk_hash: &str,
        meta: FirstChunkMeta,
        body: R,
    ) -> Result<u64, UploadError> {
        let size = self.stage_chunk(file_id, 0, chunk_hash, body).await?;
        let chunks = &self.inner.chunks;

        let sidecar = UploadSidecar {
            filename: sanitize_filename(&meta.filename),
            total_chunks,
            file_size,
            content_type: meta.content_type,
            is_encrypted: meta.is_encrypted,
            expiry: meta.expiry,
            upload_time: Utc::now(),
        };
        chunks.write_sidecar(file_id, &sidecar).await?;

        if let Some(sample) = meta.encrypted_sample.filter(|_| meta.is_encrypted) {
            if let Err(e) = chunks.write_sample(file_id, &sample).await {
                tracing::warn!(file_id = %file_id, error = %e, "Failed to stage encrypted sample");
            }
        }

        Ok(size)
    }

    /// Stage one authorized chunk and record it in its session. Returns the
    /// chunk's size.
    ///
    /// An index already staged is never rewritten: a retry with the same
    /// digest is accepted as is, any other digest is a mismatch.
    async fn stage_chunk<R: AsyncRead>(
        &self,
        file_id: Uuid,
        chunk_index: u32,
        chunk_hash: &str,
        body: R,
    ) -> Result<u64, UploadError> {
        let sessions = &self.inner.sessions;
        let allowance = sessions
            .chunk_allowance(file_id, chunk_index)
            .ok_or(UploadError::InvalidToken(file_id))?;

        if let Some(staged) = allowance.staged {
            if !staged.hash.eq_ignore_ascii_case(chunk_hash.trim()) {
                tracing::warn!(file_id = %file_id, chunk_index, "Retry differs from staged chunk");
                return Err(UploadError::ChunkHashMismatch {
                    expected: staged.hash,
                    actual: chunk_hash.to_string(),
                });
            }
            tracing::debug!(file_id = %file_id, chunk_index, "Chunk already staged");
            return Ok(staged.size);
        }

        let ceiling = self.max_chunk_size();
        let limit = ceiling.min(allowance.remaining);
        let partial = match self
            .inner
            .chunks
            .stage_chunk(file_id, chunk_index, body, chunk_hash, limit)
            .await
        {
            Err(UploadError::ChunkTooLarge { .. }) if allowance.remaining < ceiling => {
                return Err(UploadError::FileTooLarge {
                    size: allowance.file_size - allowance.remaining + limit + 1,
                    max: allowance.file_size,
                });
            }
            result => result?,
        };

        match sessions.commit_chunk(file_id, partial.chunk().clone()) {
            Ok(ChunkCommit::Staged) => match partial.promote().await {
                Ok(chunk) => Ok(chunk.size),
                Err(e) => {
                    sessions.forget_chunk(file_id, chunk_index);
                    Err(e)
                }
            },
            Ok(ChunkCommit::Duplicate) => {
                let size = partial.chunk().size;
                partial.discard().await;
                Ok(size)
            }
            Err(e) => {
                partial.discard().await;
                Err(e)
            }
        }
    }

    /// Assemble a completed chunked upload into the object store.
    ///
    /// Staging is removed only after a successful put; a failed assembly
    /// stores nothing and leaves the staged files in place.
    pub async fn finalize(&self, file_id: Uuid, token: &str) -> Result<FileRecord, UploadError> {
        let total_chunks = self.inner.sessions.finalize(file_id, token)?;
        let chunks = self.inner.chunks.clone();

        let sidecar = chunks.read_sidecar(file_id).await?;
        if sidecar.total_chunks != total_chunks {
            return Err(UploadError::TotalChunksMismatch {
                expected: sidecar.total_chunks,
                actual: total_chunks,
            });
        }

        let total_size: u64 = chunks.chunk_sizes(file_id, total_chunks).await?.iter().sum();
        let max = self.inner.policy.max_upload_size;
        if total_size > max {
            return Err(UploadError::FileTooLarge { size: total_size, max });
        }
        if total_size != sidecar.file_size {
            tracing::warn!(
                file_id = %file_id,
                declared = sidecar.file_size,
                actual = total_size,
                "Assembled size differs from declared size"
            );
        }

        let sample = if sidecar.is_encrypted {
            chunks.read_sample(file_id).await?
        } else {
            None
        };

        let store = self.inner.store.clone();
        let allowed_types = self.inner.policy.allowed_types.clone();
        let assembler = chunks.clone();
        let record = tokio::task::spawn_blocking(move || -> Result<FileRecord, UploadError> {
            let mut head = Vec::with_capacity(SNIFF_LEN);
            assembler
                .assembly_reader(file_id, total_chunks)
                .take(SNIFF_LEN as u64)
                .read_to_end(&mut head)?;
            let mime_type = detect_mime_from_bytes(&head);
            validate_content_type(&mime_type, &allowed_types)?;
            if !sidecar.content_type.trim().is_empty() {
                validate_content_type(&sidecar.content_type, &allowed_types)?;
            }

            let mut record = FileRecord::new(
                file_id,
                sidecar.filename,
                mime_type,
                total_size,
                sidecar.expiry,
                Utc::now(),
            );
            record.is_encrypted = sidecar.is_encrypted;
            record.encrypted_sample = sample;

            let mut reader = assembler.assembly_reader(file_id, total_chunks);
            store.put(&mut record, Some(&mut reader))?;
            if record.size != total_size {
                tracing::warn!(
                    file_id = %file_id,
                    expected = total_size,
                    stored = record.size,
                    "Staged chunks changed during assembly"
                );
            }
            Ok(record)
        })
        .await
        .map_err(|e| UploadError::InternalError(format!("Assembly task failed: {}", e)))??;

        if let Err(e) = chunks.delete_staging(file_id).await {
            tracing::warn!(file_id = %file_id, error = %e, "Failed to remove staging after finalize");
        }

        tracing::info!(
            file_id = %file_id,
            filename = %record.filename,
            mime_type = %record.mime_type,
            size = record.size,
            chunks = total_chunks,
            "Chunked upload finalized"
        );

        Ok(record)
    }

    // ========================================================================
    // Single-shot Uploads
    // ========================================================================

    /// Store a file received in a single request
    pub async fn upload_single(&self, upload: SingleUpload) -> Result<FileRecord, UploadError> {
        let size = upload.content.len() as u64;
        let max = self.inner.policy.max_upload_size;
        if size > max {
            return Err(UploadError::FileTooLarge { size, max });
        }

        let mime_type = detect_mime_from_bytes(&upload.content);
        validate_content_type(&mime_type, &self.inner.policy.allowed_types)?;

        let mut record = FileRecord::new(
            Uuid::new_v4(),
            sanitize_filename(&upload.filename),
            mime_type,
            size,
            upload.expiry,
            Utc::now(),
        );
        record.is_encrypted = upload.is_encrypted;
        record.encrypted_sample = upload.encrypted_sample.filter(|_| upload.is_encrypted);

        let store = self.inner.store.clone();
        let content = upload.content;
        let record = tokio::task::spawn_blocking(move || -> Result<FileRecord, UploadError> {
            let mut reader = Cursor::new(content);
            store.put(&mut record, Some(&mut reader))?;
            Ok(record)
        })
        .await
        .map_err(|e| UploadError::InternalError(format!("Store task failed: {}", e)))??;

        tracing::info!(
            file_id = %record.id,
            filename = %record.filename,
            mime_type = %record.mime_type,
            size = record.size,
            expiry = record.expiry_policy.as_str(),
            "File uploaded"
        );

        Ok(record)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn record_exists(&self, file_id: Uuid) -> Result<bool, UploadError> {
        let store = self.inner.store.clone();
        let lookup = tokio::task::spawn_blocking(move || store.get(&file_id))
            .await
            .map_err(|e| UploadError::InternalError(format!("Lookup task failed: {}", e)))?;
        match lookup {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reap idle sessions and remove their staging directories
    pub async fn cleanup_idle_sessions(&self) -> usize {
        let reaped = self.inner.sessions.cleanup_idle();
        for file_id in &reaped {
            if let Err(e) = self.inner.chunks.delete_staging(*file_id).await {
                tracing::warn!(file_id = %file_id, error = %e, "Failed to remove staging for idle session");
            }
        }
        reaped.len()
    }

    /// Start the idle-session sweep
    pub fn start_cleanup_task(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        self.cleanup_idle_sessions().await;
                    }
                }
            }

            tracing::debug!("Upload session cleanup task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Expiry, ExpiryPolicy};
    use crate::store::StoreConfig;
    use crate::upload::chunk_store::compute_hash;
    use tempfile::TempDir;

    struct Harness {
        _data: TempDir,
        _staging: TempDir,
        store: ObjectStore,
        service: UploadService,
    }

    fn harness(allowed_types: &[&str]) -> Harness {
        let data = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let mut config = StoreConfig::new(data.path(), 1024 * 1024);
        config.sync_writes = false;
        let store = ObjectStore::open(&config).unwrap();
        let service = UploadService::new(
            SessionManager::new(),
            ChunkStore::with_local_storage(staging.path().to_path_buf()),
            store.clone(),
            UploadPolicy {
                max_upload_size: 1024 * 1024,
                allowed_types: allowed_types.iter().map(|s| s.to_string()).collect(),
            },
        );
        Harness {
            _data: data,
            _staging: staging,
            store,
            service,
        }
    }

    fn submission(file_id: Uuid, index: u32, parts: &[&[u8]], token: Option<&str>) -> ChunkSubmission {
        let file_size = parts.iter().map(|p| p.len() as u64).sum();
        ChunkSubmission {
            file_id,
            chunk_index: index,
            total_chunks: parts.len() as u32,
            file_size,
            chunk_hash: compute_hash(parts[index as usize]),
            token: token.map(str::to_string),
            first: (index == 0).then(|| FirstChunkMeta {
                filename: "../notes.txt".to_string(),
                expiry: ExpiryPolicy::OneDay,
                ..Default::default()
            }),
        }
    }

    fn read_content(store: &ObjectStore, id: &Uuid) -> Vec<u8> {
        let mut out = Vec::new();
        store.content_stream(id).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_chunked_upload_out_of_order() {
        let h = harness(&["*"]);
        let file_id = Uuid::new_v4();
        let parts: [&[u8]; 4] = [b"alpha ", b"beta ", b"gamma ", b"delta"];

        let first = h
            .service
            .submit_chunk(submission(file_id, 0, &parts, None), parts[0])
            .await
            .unwrap();
        let tokens = first.next_tokens;
        assert_eq!(tokens.len(), 3);

        let third = h
            .service
            .submit_chunk(submission(file_id, 3, &parts, Some(&tokens[&3])), parts[3])
            .await
            .unwrap();
        let finalize_token = third.next_tokens[&4].clone();

        for index in [2u32, 1] {
            h.service
                .submit_chunk(
                    submission(file_id, index, &parts, Some(&tokens[&index])),
                    parts[index as usize],
                )
                .await
                .unwrap();
        }

        let record = h.service.finalize(file_id, &finalize_token).await.unwrap();
        assert_eq!(record.filename, "notes.txt");
        assert_eq!(record.mime_type, "text/plain");
        assert_eq!(record.size, 22);
        assert!(matches!(record.expiry, Expiry::At(_)));
        assert_eq!(read_content(&h.store, &file_id), b"alpha beta gamma delta");
        assert!(!h.service.chunks().has_staging(file_id).await);
    }

    #[tokio::test]
    async fn test_finalize_with_missing_chunk_stores_nothing() {
        let h = harness(&["*"]);
        let file_id = Uuid::new_v4();
        let parts: [&[u8]; 2] = [b"one", b"two"];

        let first = h
            .service
            .submit_chunk(submission(file_id, 0, &parts, None), parts[0])
            .await
            .unwrap();
        let second = h
            .service
            .submit_chunk(
                submission(file_id, 1, &parts, Some(&first.next_tokens[&1])),
                &b"owt"[..],
            )
            .await;
        assert!(matches!(second, Err(UploadError::ChunkHashMismatch { .. })));

        let result = h.service.finalize(file_id, &first.next_tokens[&2]).await;
        assert!(matches!(result, Err(UploadError::MissingChunk(1))));
        assert!(h.store.get(&file_id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_chunk_without_token_rejected() {
        let h = harness(&["*"]);
        let file_id = Uuid::new_v4();
        let parts: [&[u8]; 2] = [b"one", b"two"];

        h.service
            .submit_chunk(submission(file_id, 0, &parts, None), parts[0])
            .await
            .unwrap();
        let result = h
            .service
            .submit_chunk(submission(file_id, 1, &parts, None), parts[1])
            .await;
        assert!(matches!(result, Err(UploadError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn test_failed_first_chunk_can_be_retried() {
        let h = harness(&["*"]);
        let file_id = Uuid::new_v4();
        let parts: [&[u8]; 1] = [b"only"];

        let bad = h
            .service
            .submit_chunk(submission(file_id, 0, &parts, None), &b"ONLY"[..])
            .await;
        assert!(matches!(bad, Err(UploadError::ChunkHashMismatch { .. })));
        assert!(!h.service.sessions().is_active(file_id));

        let retry = h
            .service
            .submit_chunk(submission(file_id, 0, &parts, None), parts[0])
            .await
            .unwrap();
        let record = h.service.finalize(file_id, &retry.next_tokens[&1]).await.unwrap();
        assert_eq!(record.size, 4);
    }

    #[tokio::test]
    async fn test_retry_with_different_bytes_keeps_staged_chunk() {
        let h = harness(&["*"]);
        let file_id = Uuid::new_v4();
        let parts: [&[u8]; 2] = [b"AAAA", b"BBBB"];

        let first = h
            .service
            .submit_chunk(submission(file_id, 0, &parts, None), parts[0])
            .await
            .unwrap();
        let token = first.next_tokens[&1].clone();
        let second = h
            .service
            .submit_chunk(submission(file_id, 1, &parts, Some(&token)), parts[1])
            .await
            .unwrap();

        let replacement = b"ZZZZZZZZZZZZ";
        let mut swap = submission(file_id, 1, &parts, Some(&token));
        swap.chunk_hash = compute_hash(replacement);
        let result = h.service.submit_chunk(swap, &replacement[..]).await;
        assert!(matches!(result, Err(UploadError::ChunkHashMismatch { .. })));

        // an identical retry is still fine
        let retry = h
            .service
            .submit_chunk(submission(file_id, 1, &parts, Some(&token)), parts[1])
            .await
            .unwrap();
        assert_eq!(retry.chunk_size, 4);

        let record = h
            .service
            .finalize(file_id, &second.next_tokens[&2])
            .await
            .unwrap();
        assert_eq!(record.size, 8);
        assert_eq!(read_content(&h.store, &file_id), b"AAAABBBB");
    }

    #[tokio::test]
    async fn test_chunk_beyond_declared_size_rejected_while_streaming() {
        let h = harness(&["*"]);
        let file_id = Uuid::new_v4();
        let big = vec![b'x'; 3 * 1024 * 1024];
        let declared: [&[u8]; 1] = [b"0123456789"];

        let mut first = submission(file_id, 0, &declared, None);
        first.chunk_hash = compute_hash(&big);
        let result = h.service.submit_chunk(first, big.as_slice()).await;
        assert!(matches!(result, Err(UploadError::FileTooLarge { max: 10, .. })));
        assert!(!h.service.sessions().is_active(file_id));
        assert!(h.service.chunks().chunk_sizes(file_id, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_staged_total_cannot_pass_declared_size() {
        let h = harness(&["*"]);
        let file_id = Uuid::new_v4();
        let parts: [&[u8]; 2] = [b"abcd", b"efgh"];

        let first = h
            .service
            .submit_chunk(submission(file_id, 0, &parts, None), parts[0])
            .await
            .unwrap();

        let oversized = b"efghij";
        let mut second = submission(file_id, 1, &parts, Some(&first.next_tokens[&1]));
        second.chunk_hash = compute_hash(oversized);
        let result = h.service.submit_chunk(second, &oversized[..]).await;
        assert!(matches!(result, Err(UploadError::FileTooLarge { max: 8, .. })));
        assert_eq!(h.service.sessions().staged_bytes(file_id), Some(4));
    }

    #[tokio::test]
    async fn test_chunk_capped_by_upload_limit() {
        let h = harness(&["*"]);
        assert_eq!(h.service.max_chunk_size(), 1024 * 1024);

        let file_id = Uuid::new_v4();
        let body = vec![b'y'; 1024 * 1024 + 1];
        let parts: [&[u8]; 1] = [b"x"];
        let mut first = submission(file_id, 0, &parts, None);
        first.file_size = 1024 * 1024;
        first.chunk_hash = compute_hash(&body);
        let result = h.service.submit_chunk(first, body.as_slice()).await;
        assert!(matches!(
            result,
            Err(UploadError::ChunkTooLarge { max }) if max == 1024 * 1024
        ));
    }

    #[tokio::test]
    async fn test_chunk_count_must_fit_declared_size() {
        let h = harness(&["*"]);
        let parts: [&[u8]; 1] = [b"0123456789"];
        let mut first = submission(Uuid::new_v4(), 0, &parts, None);
        first.total_chunks = 1000;
        let result = h.service.submit_chunk(first, &b"0123456789"[..]).await;
        assert!(matches!(result, Err(UploadError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_finalize_rejects_disallowed_type() {
        let h = harness(&["image/"]);
        let file_id = Uuid::new_v4();
        let parts: [&[u8]; 1] = [b"plain text body"];

        let first = h
            .service
            .submit_chunk(submission(file_id, 0, &parts, None), parts[0])
            .await
            .unwrap();
        let result = h.service.finalize(file_id, &first.next_tokens[&1]).await;
        assert!(matches!(result, Err(UploadError::InvalidFileType(_))));
        assert!(h.store.get(&file_id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_single_upload() {
        let h = harness(&["*"]);
        let upload = SingleUpload {
            filename: "photo.png".to_string(),
            content: axum::body::Bytes::from_static(&[
                0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0,
            ]),
            expiry: ExpiryPolicy::OnFirstView,
            is_encrypted: false,
            encrypted_sample: Some(vec![1, 2, 3]),
        };

        let record = h.service.upload_single(upload).await.unwrap();
        assert_eq!(record.mime_type, "image/png");
        assert_eq!(record.expiry, Expiry::OnFirstView);
        assert_eq!(record.encrypted_sample, None);
        assert_eq!(h.store.get(&record.id).unwrap(), record);
    }

    #[tokio::test]
    async fn test_single_upload_rejects_executable() {
        let h = harness(&["*"]);
        let upload = SingleUpload {
            filename: "setup.exe".to_string(),
            content: axum::body::Bytes::from_static(b"MZ\x90\x00\x03\x00"),
            expiry: ExpiryPolicy::OneHour,
            is_encrypted: false,
            encrypted_sample: None,
        };
        assert!(matches!(
            h.service.upload_single(upload).await,
            Err(UploadError::InvalidFileType(_))
        ));
    }
}
