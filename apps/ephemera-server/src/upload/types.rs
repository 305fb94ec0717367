//! Upload types for the chunked upload protocol

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ExpiryPolicy;
use crate::store::StoreError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum size of a single chunk: 85MB
pub const MAX_CHUNK_SIZE: u64 = 85 * 1024 * 1024;

/// Number of future chunk tokens handed out with each accepted chunk
pub const TOKEN_LOOKAHEAD: u32 = 3;

/// Sessions idle for longer than this are reaped: 3 hours
pub const SESSION_IDLE_HOURS: i64 = 3;

/// How often idle sessions are swept: 30 minutes
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 30 * 60;

/// Largest accepted encrypted sample: 64KB
pub const MAX_SAMPLE_SIZE: usize = 64 * 1024;

/// Tokens keyed by the chunk index they authorize
pub type TokenBatch = BTreeMap<u32, String>;

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Fields sent with chunk 0 only
#[derive(Debug, Clone, Default)]
pub struct FirstChunkMeta {
    pub filename: String,
    /// Client-declared type, checked but never stored
    pub content_type: String,
    pub is_encrypted: bool,
    pub encrypted_sample: Option<Vec<u8>>,
    pub expiry: ExpiryPolicy,
}

/// One chunk request, minus its body
#[derive(Debug, Clone)]
pub struct ChunkSubmission {
    pub file_id: Uuid,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Declared size of the whole file
    pub file_size: u64,
    /// Hex SHA-256 of this chunk's bytes
    pub chunk_hash: String,
    /// Token from `X-Chunk-Token`, required for every index but 0
    pub token: Option<String>,
    pub first: Option<FirstChunkMeta>,
}

/// Response to an accepted chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAccepted {
    pub status: String,
    pub file_id: Uuid,
    pub chunk_index: u32,
    pub chunk_size: u64,
    pub next_tokens: TokenBatch,
}

/// Receipt for a chunk written to staging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedChunk {
    pub index: u32,
    pub size: u64,
    pub hash: String,
}

/// Staging room left for one chunk index
#[derive(Debug, Clone)]
pub struct ChunkAllowance {
    /// Chunk already staged under this index
    pub staged: Option<StagedChunk>,
    /// Declared size minus the bytes staged by other indices
    pub remaining: u64,
    pub file_size: u64,
}

/// Outcome of recording a verified chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkCommit {
    /// First copy of this index, move it into place
    Staged,
    /// Identical retry, keep the staged copy
    Duplicate,
}

// ============================================================================
// Staging Sidecar
// ============================================================================

/// Upload metadata persisted next to the staged chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSidecar {
    pub filename: String,
    pub total_chunks: u32,
    /// Size declared by the client at chunk 0
    pub file_size: u64,
    pub content_type: String,
    pub is_encrypted: bool,
    pub expiry: ExpiryPolicy,
    pub upload_time: DateTime<Utc>,
}

// ============================================================================
// Single-shot Upload
// ============================================================================

/// A complete file received in one request
#[derive(Debug, Clone)]
pub struct SingleUpload {
    pub filename: String,
    pub content: axum::body::Bytes,
    pub expiry: ExpiryPolicy,
    pub is_encrypted: bool,
    pub encrypted_sample: Option<Vec<u8>>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid or missing chunk token for {0}")]
    InvalidToken(Uuid),

    #[error("Upload already in progress: {0}")]
    SessionActive(Uuid),

    #[error("File already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },

    #[error("Chunk index out of bounds: {index} (total: {total})")]
    ChunkIndexOutOfBounds { index: u32, total: u32 },

    #[error("Total chunk count changed: expected {expected}, got {actual}")]
    TotalChunksMismatch { expected: u32, actual: u32 },

    #[error("Missing chunk: {0}")]
    MissingChunk(u32),

    #[error("No staged upload for {0}")]
    StagingNotFound(Uuid),

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Chunk too large (max: {max} bytes)")]
    ChunkTooLarge { max: u64 },

    #[error("File type not allowed: {0}")]
    InvalidFileType(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidToken(_) => StatusCode::FORBIDDEN,
            Self::SessionActive(_) => StatusCode::FORBIDDEN,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::ChunkHashMismatch { .. } => StatusCode::CONFLICT,
            Self::ChunkIndexOutOfBounds { .. } => StatusCode::BAD_REQUEST,
            Self::TotalChunksMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::MissingChunk(_) => StatusCode::BAD_REQUEST,
            Self::StagingNotFound(_) => StatusCode::NOT_FOUND,
            Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ChunkTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::StorageError(StoreError::ValueTooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::StorageError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidToken(_) | Self::SessionActive(_) => "auth_error",
            Self::AlreadyExists(_) => "conflict",
            Self::ChunkHashMismatch { .. } => "integrity_error",
            Self::StagingNotFound(_) => "not_found",
            Self::FileTooLarge { .. }
            | Self::ChunkTooLarge { .. }
            | Self::StorageError(StoreError::ValueTooLarge { .. }) => "too_large",
            Self::InvalidFileType(_) => "unsupported_type",
            Self::ChunkIndexOutOfBounds { .. }
            | Self::TotalChunksMismatch { .. }
            | Self::MissingChunk(_)
            | Self::InvalidRequest(_) => "bad_request",
            Self::StorageError(_) | Self::Io(_) | Self::InternalError(_) => "storage_error",
        }
    }
}
