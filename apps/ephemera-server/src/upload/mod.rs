//! Chunked Upload Module
//!
//! Implements resumable uploads of large files with:
//! - HMAC chunk tokens handed out a few indices ahead
//! - SHA-256 verification of every chunk while it streams to disk
//! - Out-of-order, concurrent chunk submission
//! - Sequential reassembly into the object store on finalize
//!
//! Protocol Flow:
//! 1. Client sends chunk 0 with file metadata and receives tokens for chunks 1..=3
//! 2. Each further chunk carries its token and returns tokens further ahead
//! 3. The token for index `total_chunks` authorizes finalize
//! 4. Server sniffs, validates and stores the assembled file

pub mod chunk_store;
pub mod service;
pub mod session;
pub mod types;
pub mod validation;

pub use chunk_store::{compute_hash, ChunkStore};
pub use service::{UploadPolicy, UploadService};
pub use session::SessionManager;
pub use types::*;
