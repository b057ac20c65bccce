//! Blob storage module for S3-compatible backends
//!
//! Documents and everything derived from them (page images, tables,
//! translated renders) live here. The cleaner only ever checks and deletes.

mod memory;
mod s3_client;

pub use memory::MemoryBlobStore;
pub use s3_client::S3Client;

use crate::error::StorageError;

/// Object operations the cleanup handlers need
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Check if an object exists
    async fn object_exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Delete an object. Returns `false` if it was already gone.
    async fn delete_object(&self, key: &str) -> Result<bool, StorageError>;
}
