//! Data models

pub mod file;

pub use file::{expiry_options, Expiry, ExpiryOption, ExpiryPolicy, FileRecord};
