//! Persistent storage
//!
//! A log-structured engine ([`log`]) with a compressed object store facade
//! ([`object_store`]) on top.

pub mod error;
pub mod log;
pub mod object_store;

pub use error::{StoreError, StoreResult};
pub use object_store::{ContentStream, ObjectStore, StoreConfig};
