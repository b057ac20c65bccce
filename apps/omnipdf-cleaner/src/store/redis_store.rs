//! Redis keyed store
//!
//! Commands go through a `ConnectionManager`, which reconnects on its own.
//! Each notification subscription opens a dedicated pub/sub connection whose
//! stream ends when that connection drops.

use std::time::Duration;

use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};

use crate::error::StoreError;

use super::{KeyedStore, KeyspaceNotifier, MessageKind, Notification, NotificationStream};

/// Redis-backed keyed store
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis. Fails if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        let mut probe = conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut probe).await?;
        tracing::info!(reply = %pong, "Connected to Redis");

        Ok(Self { client, conn })
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

#[async_trait::async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let applied: bool = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2: missing key, -1: no expiry
        Ok((remaining >= 0).then(|| Duration::from_millis(remaining as u64)))
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().sadd(key, member);
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
        }
        let (added,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(added > 0)
    }

    async fn remove_member(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().srem(key, member);
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
        }
        let (removed,): (i64,) = pipe.query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members.into_iter().filter(|m| !m.is_empty()).collect())
    }

    async fn contains_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn replace_members(
        &self,
        key: &str,
        members: &[String],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !members.is_empty() {
            pipe.sadd(key, members).ignore();
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyspaceNotifier for RedisStore {
    async fn enable_notifications(&self, classes: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(classes)
            .query_async(&mut conn)
            .await?;
        tracing::info!(classes = %classes, "Enabled keyspace notifications (store-wide)");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        tracing::info!(pattern = %pattern, "Subscribed to keyspace notifications");

        let stream = pubsub.into_on_message().map(|msg| {
            let kind = if msg.from_pattern() {
                MessageKind::PMessage
            } else {
                MessageKind::Message
            };
            Notification {
                kind,
                pattern: msg.get_pattern().ok(),
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload().unwrap_or_default(),
            }
        });

        Ok(stream.boxed())
    }
}
