//! Keyspace-driven cleanup
//!
//! Services schedule cleanup by writing a tagged flag key with a TTL. When
//! the flag expires (or is deleted) the keyed store publishes a keyspace
//! notification; the [`Watcher`] picks it up, parses the tag, and hands the
//! identifier to the matching handler in the [`Dispatcher`].

mod dispatch;
mod watcher;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::error::{StorageError, StoreError};
use crate::keys::TaggedKey;
use crate::store::{KeyedStore, Namespace, StringStorage};

pub use dispatch::{Cleanup, CleanupReport, Dispatcher};
pub use watcher::{
    CleanupJob, JobOutcome, Watcher, WatcherHandle, WatcherState, WatcherStats, WatcherStatus,
};

/// Events that end a key's life
pub const CLEANUP_EVENTS: [&str; 2] = ["del", "expired"];

/// Value written to flag keys; only the key and its TTL matter
const FLAG_VALUE: &str = "1";

/// Cleanup handler failures
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("cleanup handler panicked: {0}")]
    Panicked(String),
}

/// Write a flag key that triggers cleanup of `key`'s resource after `ttl`
pub async fn schedule_cleanup(
    store: Arc<dyn KeyedStore>,
    key: &TaggedKey,
    ttl: Duration,
) -> Result<(), StoreError> {
    let flags = StringStorage::new(store, Namespace::new(key.tag().prefix()));
    flags
        .set_with_ttl(key.identifier(), FLAG_VALUE, Some(ttl))
        .await?;
    tracing::info!(key = %key, ttl_secs = ttl.as_secs(), "Scheduled cleanup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Tag;
    use crate::store::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_writes_expiring_flag() {
        let store = MemoryStore::new();
        let key = TaggedKey::new(Tag::S3Key, "doc1").unwrap();
        schedule_cleanup(Arc::new(store.clone()), &key, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(store.get("S3Key:doc1").await.unwrap(), Some("1".to_string()));
        assert_eq!(
            store.ttl("S3Key:doc1").await.unwrap(),
            Some(Duration::from_secs(30))
        );

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!store.exists("S3Key:doc1").await.unwrap());
    }
}
