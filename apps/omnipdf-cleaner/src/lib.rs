//! OmniPDF Cleaner Library
//!
//! Session-scoped document tracking plus a keyspace-notification-driven
//! garbage collector for everything a session leaves behind.
//!
//! # Modules
//!
//! - `store`: Keyed store backends (Redis, in-memory) and typed views
//! - `storage`: S3-compatible blob storage
//! - `session`: Session / document associations with TTL keep-alive
//! - `cleaner`: Notification watcher and cleanup handlers
//! - `routes`: HTTP control surface

pub mod cleaner;
pub mod config;
pub mod error;
pub mod keys;
pub mod routes;
pub mod session;
pub mod state;
pub mod storage;
pub mod store;
