//! Ephemera Server Library
//!
//! Ephemeral file sharing: uploads (single-shot or chunked with per-chunk
//! tokens) land in an embedded compressed object store and expire after a
//! fixed duration or on first download.
//!
//! # Modules
//!
//! - `store`: Append-only log engine and the compressed object store on top
//! - `upload`: Chunk staging, upload sessions and finalization
//! - `retrieval`: Expiry-aware reads and view-once claims
//! - `routes`: HTTP handlers and the router

pub mod config;
pub mod csrf;
pub mod error;
pub mod models;
pub mod rate_limit;
pub mod retrieval;
pub mod routes;
pub mod state;
pub mod store;
pub mod upload;
