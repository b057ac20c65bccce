//! In-memory blob store

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StorageError;

use super::BlobStore;

/// Object map with an optional injected failure, for exercising cleanup paths
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    inner: Arc<Mutex<MemoryBlobs>>,
}

#[derive(Default)]
struct MemoryBlobs {
    objects: BTreeMap<String, Vec<u8>>,
    deletions: Vec<String>,
    unavailable: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.inner.lock().objects.insert(key.into(), data.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().objects.keys().cloned().collect()
    }

    /// Keys passed to `delete_object`, in call order
    pub fn deletions(&self) -> Vec<String> {
        self.inner.lock().deletions.clone()
    }

    /// Make every call fail as if the backend were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    async fn object_exists(&self, key: &str) -> Result<bool, StorageError> {
        let blobs = self.inner.lock();
        if blobs.unavailable {
            return Err(StorageError::ConnectionFailed("memory store offline".to_string()));
        }
        Ok(blobs.objects.contains_key(key))
    }

    async fn delete_object(&self, key: &str) -> Result<bool, StorageError> {
        let mut blobs = self.inner.lock();
        if blobs.unavailable {
            return Err(StorageError::ConnectionFailed("memory store offline".to_string()));
        }
        blobs.deletions.push(key.to_string());
        Ok(blobs.objects.remove(key).is_some())
    }
}
