//! Typed, namespaced views over a `KeyedStore`

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

use super::KeyedStore;

/// Key prefix plus the TTL applied to writes (and, for sets, reads)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
    default_ttl: Option<Duration>,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            default_ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Full store key for an id in this namespace
    pub fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }
}

/// Scalar string values
#[derive(Clone)]
pub struct StringStorage {
    store: Arc<dyn KeyedStore>,
    namespace: Namespace,
}

impl StringStorage {
    pub fn new(store: Arc<dyn KeyedStore>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub async fn get(&self, id: &str) -> Result<Option<String>, StoreError> {
        self.store.get(&self.namespace.key(id)).await
    }

    /// Write with the namespace default TTL
    pub async fn set(&self, id: &str, value: &str) -> Result<(), StoreError> {
        self.set_with_ttl(id, value, self.namespace.default_ttl).await
    }

    pub async fn set_with_ttl(
        &self,
        id: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.store.set(&self.namespace.key(id), value, ttl).await
    }

    /// Write only if absent. Returns whether the value was written.
    pub async fn set_if_absent(&self, id: &str, value: &str) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&self.namespace.key(id), value, self.namespace.default_ttl)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.namespace.key(id)).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.namespace.key(id)).await
    }
}

/// JSON-encoded values
pub struct JsonStorage<T> {
    store: Arc<dyn KeyedStore>,
    namespace: Namespace,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for JsonStorage<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> JsonStorage<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Arc<dyn KeyedStore>, namespace: Namespace) -> Self {
        Self {
            store,
            namespace,
            _marker: PhantomData,
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Read and decode. Undecodable data is `StoreError::CorruptData`.
    pub async fn get(&self, id: &str) -> Result<Option<T>, StoreError> {
        let key = self.namespace.key(id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|_| StoreError::CorruptData { key })
    }

    pub async fn set(&self, id: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.store
            .set(&self.namespace.key(id), &raw, self.namespace.default_ttl)
            .await
    }

    /// Write only if absent. Returns whether the value was written.
    pub async fn set_if_absent(&self, id: &str, value: &T) -> Result<bool, StoreError> {
        let raw = serde_json::to_string(value)?;
        self.store
            .set_if_absent(&self.namespace.key(id), &raw, self.namespace.default_ttl)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.namespace.key(id)).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.namespace.key(id)).await
    }

    /// Reset the entry's TTL to the namespace default. No-op without one.
    pub async fn touch(&self, id: &str) -> Result<bool, StoreError> {
        match self.namespace.default_ttl {
            Some(ttl) => self.store.expire(&self.namespace.key(id), ttl).await,
            None => self.store.exists(&self.namespace.key(id)).await,
        }
    }
}

/// Set values. With a default TTL, reads keep the entry alive.
#[derive(Clone)]
pub struct SetStorage {
    store: Arc<dyn KeyedStore>,
    namespace: Namespace,
}

impl SetStorage {
    pub fn new(store: Arc<dyn KeyedStore>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub async fn add(&self, id: &str, member: &str) -> Result<bool, StoreError> {
        self.store
            .add_member(&self.namespace.key(id), member, self.namespace.default_ttl)
            .await
    }

    pub async fn remove(&self, id: &str, member: &str) -> Result<bool, StoreError> {
        self.store
            .remove_member(&self.namespace.key(id), member, self.namespace.default_ttl)
            .await
    }

    /// Members, refreshing the TTL
    pub async fn members(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let members = self.snapshot(id).await?;
        if !members.is_empty() {
            self.touch(id).await?;
        }
        Ok(members)
    }

    /// Members without touching the TTL
    pub async fn snapshot(&self, id: &str) -> Result<Vec<String>, StoreError> {
        self.store.members(&self.namespace.key(id)).await
    }

    /// Membership test, refreshing the TTL
    pub async fn contains(&self, id: &str, member: &str) -> Result<bool, StoreError> {
        let key = self.namespace.key(id);
        let found = self.store.contains_member(&key, member).await?;
        self.touch(id).await?;
        Ok(found)
    }

    /// Replace the whole set in one transaction
    pub async fn assign(&self, id: &str, members: &[String]) -> Result<(), StoreError> {
        self.store
            .replace_members(&self.namespace.key(id), members, self.namespace.default_ttl)
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete(&self.namespace.key(id)).await
    }

    pub async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.namespace.key(id)).await
    }

    async fn touch(&self, id: &str) -> Result<(), StoreError> {
        if let Some(ttl) = self.namespace.default_ttl {
            self.store.expire(&self.namespace.key(id), ttl).await?;
        }
        Ok(())
    }
}
