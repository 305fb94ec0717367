//! Upload Session Manager
//!
//! Tracks one in-progress chunked upload per file id and authorizes its
//! chunks with HMAC tokens:
//! - Chunk 0 opens a session with a fresh random secret
//! - Every accepted chunk returns tokens for the next few indices
//! - The token for index `total_chunks` authorizes finalization
//! - Staged chunks are recorded with their digest and size, so a chunk is
//!   staged at most once and the staged total never exceeds the declared size
//! - Idle sessions are reaped by a periodic sweep

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::types::{
    ChunkAllowance, ChunkCommit, StagedChunk, TokenBatch, UploadError, SESSION_IDLE_HOURS,
    TOKEN_LOOKAHEAD,
};

type HmacSha256 = Hmac<Sha256>;

const SECRET_LEN: usize = 32;

// ============================================================================
// Upload Session
// ============================================================================

#[derive(Clone)]
struct UploadSession {
    secret: [u8; SECRET_LEN],
    /// Lowest index not yet confirmed in strict order
    next_index: u32,
    total_chunks: u32,
    /// Size declared with chunk 0
    file_size: u64,
    staged: HashMap<u32, StagedChunk>,
    last_updated: DateTime<Utc>,
}

impl UploadSession {
    fn token(&self, index: u32) -> Result<String, UploadError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| UploadError::InternalError(format!("HMAC key rejected: {}", e)))?;
        mac.update(format!("chunk{}", index).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, index: u32, presented: &str) -> Result<bool, UploadError> {
        let expected = self.token(index)?;
        let presented = presented.trim().to_ascii_lowercase();
        Ok(expected.as_bytes().ct_eq(presented.as_bytes()).into())
    }

    /// Tokens for `after + 1 ..= min(after + TOKEN_LOOKAHEAD, total_chunks)`
    fn lookahead(&self, after: u32) -> Result<TokenBatch, UploadError> {
        let last = after.saturating_add(TOKEN_LOOKAHEAD).min(self.total_chunks);
        ((after + 1)..=last)
            .map(|index| self.token(index).map(|token| (index, token)))
            .collect()
    }

    /// Bytes staged by every chunk except `index`
    fn staged_bytes_excluding(&self, index: u32) -> u64 {
        self.staged
            .values()
            .filter(|chunk| chunk.index != index)
            .map(|chunk| chunk.size)
            .sum()
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Manages upload sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionManagerInner>,
}

struct SessionManagerInner {
    /// Active sessions indexed by file ID
    sessions: Mutex<HashMap<Uuid, UploadSession>>,

    /// Sessions untouched for longer than this are reaped
    idle_timeout: Duration,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self::with_idle_timeout(Duration::hours(SESSION_IDLE_HOURS))
    }

    /// Create a session manager with a custom idle timeout
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SessionManagerInner {
                sessions: Mutex::new(HashMap::new()),
                idle_timeout,
            }),
        }
    }

    // ========================================================================
    // Session Lifecycle
    // ========================================================================

    /// Open a session for chunk 0 and return the first token batch
    pub fn begin(
        &self,
        file_id: Uuid,
        total_chunks: u32,
        file_size: u64,
    ) -> Result<TokenBatch, UploadError> {
        if total_chunks == 0 {
            return Err(UploadError::InvalidRequest(
                "total_chunks must be at least 1".to_string(),
            ));
        }

        let mut secret = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        let session = UploadSession {
            secret,
            next_index: 1,
            total_chunks,
            file_size,
            staged: HashMap::new(),
            last_updated: Utc::now(),
        };
        let batch = session.lookahead(0)?;

        let mut sessions = self.inner.sessions.lock();
        if sessions.contains_key(&file_id) {
            tracing::warn!(file_id = %file_id, "Rejected chunk 0 for an active upload");
            return Err(UploadError::SessionActive(file_id));
        }
        sessions.insert(file_id, session);
        drop(sessions);

        tracing::debug!(file_id = %file_id, total_chunks, "Upload session started");
        Ok(batch)
    }

    /// Authorize chunk `index > 0` and return the next token batch.
    ///
    /// A rejected token leaves the session untouched. Valid tokens for
    /// indices already passed are accepted again so clients can retry.
    pub fn authorize(
        &self,
        file_id: Uuid,
        index: u32,
        total_chunks: u32,
        token: &str,
    ) -> Result<TokenBatch, UploadError> {
        if index == 0 {
            return Err(UploadError::InvalidRequest(
                "chunk 0 opens a new upload".to_string(),
            ));
        }

        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(&file_id)
            .ok_or(UploadError::InvalidToken(file_id))?;

        if total_chunks != session.total_chunks {
            return Err(UploadError::TotalChunksMismatch {
                expected: session.total_chunks,
                actual: total_chunks,
            });
        }
        if index >= session.total_chunks {
            return Err(UploadError::ChunkIndexOutOfBounds {
                index,
                total: session.total_chunks,
            });
        }
        if !session.verify(index, token)? {
            tracing::warn!(file_id = %file_id, chunk_index = index, "Chunk token rejected");
            return Err(UploadError::InvalidToken(file_id));
        }

        if index == session.next_index {
            session.next_index += 1;
        }
        session.last_updated = Utc::now();
        session.lookahead(index)
    }

    /// Consume the session with the finalize token. Returns the chunk count.
    ///
    /// The session is removed whether or not the token matches.
    pub fn finalize(&self, file_id: Uuid, token: &str) -> Result<u32, UploadError> {
        let session = self
            .inner
            .sessions
            .lock()
            .remove(&file_id)
            .ok_or(UploadError::InvalidToken(file_id))?;

        if !session.verify(session.total_chunks, token)? {
            tracing::warn!(file_id = %file_id, "Finalize token rejected, session dropped");
            return Err(UploadError::InvalidToken(file_id));
        }

        Ok(session.total_chunks)
    }

    // ========================================================================
    // Staged Chunks
    // ========================================================================

    /// What chunk `index` may still stage. `None` without a session.
    pub fn chunk_allowance(&self, file_id: Uuid, index: u32) -> Option<ChunkAllowance> {
        let sessions = self.inner.sessions.lock();
        let session = sessions.get(&file_id)?;
        Some(ChunkAllowance {
            staged: session.staged.get(&index).cloned(),
            remaining: session
                .file_size
                .saturating_sub(session.staged_bytes_excluding(index)),
            file_size: session.file_size,
        })
    }

    /// Record a verified chunk before it is moved into place.
    ///
    /// A chunk already staged under the same index is only accepted again
    /// with the same digest, and the new copy must not be kept. A new chunk
    /// is refused once the staged total would pass the declared size.
    pub fn commit_chunk(&self, file_id: Uuid, chunk: StagedChunk) -> Result<ChunkCommit, UploadError> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(&file_id)
            .ok_or(UploadError::InvalidToken(file_id))?;

        if let Some(existing) = session.staged.get(&chunk.index) {
            if !existing.hash.eq_ignore_ascii_case(&chunk.hash) {
                tracing::warn!(
                    file_id = %file_id,
                    chunk_index = chunk.index,
                    "Rejected a different chunk for an index already staged"
                );
                return Err(UploadError::ChunkHashMismatch {
                    expected: existing.hash.clone(),
                    actual: chunk.hash,
                });
            }
            session.last_updated = Utc::now();
            return Ok(ChunkCommit::Duplicate);
        }

        let total = session.staged_bytes_excluding(chunk.index) + chunk.size;
        if total > session.file_size {
            return Err(UploadError::FileTooLarge {
                size: total,
                max: session.file_size,
            });
        }

        session.staged.insert(chunk.index, chunk);
        session.last_updated = Utc::now();
        Ok(ChunkCommit::Staged)
    }

    /// Undo [`SessionManager::commit_chunk`] when the chunk never landed
    pub fn forget_chunk(&self, file_id: Uuid, index: u32) {
        if let Some(session) = self.inner.sessions.lock().get_mut(&file_id) {
            session.staged.remove(&index);
        }
    }

    /// Drop a session, e.g. when chunk 0 failed to stage
    pub fn discard(&self, file_id: Uuid) -> bool {
        self.inner.sessions.lock().remove(&file_id).is_some()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_active(&self, file_id: Uuid) -> bool {
        self.inner.sessions.lock().contains_key(&file_id)
    }

    /// Next strictly-ordered index for a session
    pub fn next_index(&self, file_id: Uuid) -> Option<u32> {
        self.inner.sessions.lock().get(&file_id).map(|s| s.next_index)
    }

    pub fn staged_bytes(&self, file_id: Uuid) -> Option<u64> {
        self.inner
            .sessions
            .lock()
            .get(&file_id)
            .map(|s| s.staged.values().map(|chunk| chunk.size).sum())
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Reap idle sessions, returning their ids
    pub fn cleanup_idle(&self) -> Vec<Uuid> {
        self.cleanup_idle_at(Utc::now())
    }

    pub fn cleanup_idle_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let cutoff = now - self.inner.idle_timeout;
        let mut reaped = Vec::new();

        self.inner.sessions.lock().retain(|id, session| {
            let keep = session.last_updated >= cutoff;
            if !keep {
                reaped.push(*id);
            }
            keep
        });

        if !reaped.is_empty() {
            tracing::info!(count = reaped.len(), "Reaped idle upload sessions");
        }
        reaped
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
