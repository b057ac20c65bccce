//! Keyed store module
//!
//! The shared key/value/set store that holds sessions, TTL flags and the
//! keyspace notification stream. Backends:
//! - `RedisStore` for production
//! - `MemoryStore` for tests and local runs
//!
//! `typed` layers prefix namespacing, default TTLs and JSON on top of the
//! raw backend trait.

mod memory;
mod redis_store;
mod typed;

use std::time::Duration;

use futures::stream::BoxStream;

use crate::error::StoreError;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use typed::{JsonStorage, Namespace, SetStorage, StringStorage};

/// Pattern matching every keyspace and keyevent channel
pub const DEFAULT_NOTIFY_PATTERN: &str = "__key*__:*";

/// Keyevent notifications for generic, string, set and expired events
pub const DEFAULT_NOTIFY_CLASSES: &str = "E$gsx";

/// Raw key/value/set operations over full keys
#[async_trait::async_trait]
pub trait KeyedStore: Send + Sync {
    /// Read a scalar value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a scalar value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Write a scalar value only if the key does not exist. Returns whether it was written.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Delete a key of any type. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Check whether a key exists
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a key's TTL. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining TTL. `None` for missing keys and keys without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Add a set member, refreshing the TTL in the same transaction
    async fn add_member(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Remove a set member, refreshing the TTL in the same transaction
    async fn remove_member(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// All members of a set (empty for a missing key)
    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Set membership test
    async fn contains_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Atomically replace a set's contents. Readers never see a partial set.
    async fn replace_members(
        &self,
        key: &str,
        members: &[String],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;
}

/// Source of keyspace lifecycle notifications
#[async_trait::async_trait]
pub trait KeyspaceNotifier: Send + Sync {
    /// Turn on keyspace notifications for the given event classes.
    ///
    /// This changes store-wide configuration: every client of the store
    /// sees the new setting, not only this process.
    async fn enable_notifications(&self, classes: &str) -> Result<(), StoreError>;

    /// Pattern-subscribe to notification channels. The stream ends when the
    /// underlying connection is lost.
    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, StoreError>;
}

pub type NotificationStream = BoxStream<'static, Notification>;

/// Kind of pub/sub message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Subscription acknowledgement
    Subscribe,
    /// Message on a directly subscribed channel
    Message,
    /// Message matched by a pattern subscription
    PMessage,
}

/// One message from a notification subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: MessageKind,
    pub pattern: Option<String>,
    pub channel: String,
    pub payload: String,
}

/// Key lifecycle event extracted from a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent<'a> {
    pub event: &'a str,
    pub key: &'a str,
}

impl Notification {
    /// Extract the event name and key.
    ///
    /// Keyevent channels (`__keyevent@<db>__:<event>`) carry the key as
    /// payload; keyspace channels (`__keyspace@<db>__:<key>`) carry the event.
    pub fn key_event(&self) -> Option<KeyEvent<'_>> {
        if self.kind == MessageKind::Subscribe {
            return None;
        }
        let (scope, rest) = self.channel.split_once("__:")?;
        if scope.starts_with("__keyevent@") {
            Some(KeyEvent {
                event: rest,
                key: &self.payload,
            })
        } else if scope.starts_with("__keyspace@") {
            Some(KeyEvent {
                event: &self.payload,
                key: rest,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pmessage(channel: &str, payload: &str) -> Notification {
        Notification {
            kind: MessageKind::PMessage,
            pattern: Some(DEFAULT_NOTIFY_PATTERN.to_string()),
            channel: channel.to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_keyevent_channel() {
        let n = pmessage("__keyevent@0__:expired", "SessionHeader:abc");
        assert_eq!(
            n.key_event(),
            Some(KeyEvent {
                event: "expired",
                key: "SessionHeader:abc",
            })
        );
    }

    #[test]
    fn test_keyspace_channel_keeps_separator_in_key() {
        let n = pmessage("__keyspace@3__:S3Key:doc1", "del");
        assert_eq!(
            n.key_event(),
            Some(KeyEvent {
                event: "del",
                key: "S3Key:doc1",
            })
        );
    }

    #[test]
    fn test_non_key_channels_ignored() {
        assert_eq!(pmessage("news", "hello").key_event(), None);

        let ack = Notification {
            kind: MessageKind::Subscribe,
            pattern: None,
            channel: "__keyevent@0__:del".to_string(),
            payload: "1".to_string(),
        };
        assert_eq!(ack.key_event(), None);
    }
}
