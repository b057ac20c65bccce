//! In-memory keyed store
//!
//! Mirrors the parts of Redis behaviour the cleaner depends on: per-key TTLs
//! on the tokio clock, `notify-keyspace-events` flags, keyevent/keyspace
//! channels and glob pattern subscriptions. Expired keys are removed lazily
//! on access or by `purge_expired`, which is when their `expired` event fires.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::{future, stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use crate::error::StoreError;

use super::{KeyedStore, KeyspaceNotifier, MessageKind, Notification, NotificationStream};

const EVENT_BUFFER: usize = 1024;

/// Event classes covered by the `A` alias
const ALL_CLASSES: &str = "g$lshzxet";

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Published event before pattern matching
#[derive(Debug, Clone)]
struct RawEvent {
    channel: String,
    payload: String,
}

/// In-memory keyed store with Redis-style notifications
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

struct MemoryStoreInner {
    entries: Mutex<HashMap<String, Entry>>,
    notify_flags: Mutex<String>,
    events: Mutex<broadcast::Sender<RawEvent>>,
}

/// Events collected under the entries lock, published after it is released
type Pending = Vec<(char, &'static str, String)>;

impl MemoryStore {
    /// Create an empty store with notifications disabled
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(MemoryStoreInner {
                entries: Mutex::new(HashMap::new()),
                notify_flags: Mutex::new(String::new()),
                events: Mutex::new(events),
            }),
        }
    }

    /// Remove every expired key, emitting `expired` for each.
    /// Returns the number of keys removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut entries = self.inner.entries.lock();
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        for key in &expired {
            self.notify('x', "expired", key);
        }
        expired.len()
    }

    /// Drop every open subscription, as a lost connection would
    pub fn disconnect_subscribers(&self) {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        *self.inner.events.lock() = events;
    }

    /// Number of keys currently held, expired or not
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the live entry map. Keys found expired on the way are
    /// removed and their `expired` events published afterwards.
    fn with_entries<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, Entry>, &mut Pending) -> R,
    ) -> R {
        let mut pending = Pending::new();
        let result = {
            let mut entries = self.inner.entries.lock();
            if entries
                .get(key)
                .is_some_and(|entry| entry.is_expired(Instant::now()))
            {
                entries.remove(key);
                pending.insert(0, ('x', "expired", key.to_string()));
            }
            f(&mut *entries, &mut pending)
        };

        for (class, event, key) in pending {
            self.notify(class, event, &key);
        }
        result
    }

    fn notify(&self, class: char, event: &str, key: &str) {
        let (keyevent, keyspace) = {
            let flags = self.inner.notify_flags.lock();
            let enabled =
                flags.contains(class) || (flags.contains('A') && ALL_CLASSES.contains(class));
            (
                enabled && flags.contains('E'),
                enabled && flags.contains('K'),
            )
        };

        let events = self.inner.events.lock();
        // Sending only fails when nobody is subscribed
        if keyspace {
            let _ = events.send(RawEvent {
                channel: format!("__keyspace@0__:{}", key),
                payload: event.to_string(),
            });
        }
        if keyevent {
            let _ = events.send(RawEvent {
                channel: format!("__keyevent@0__:{}", event),
                payload: key.to_string(),
            });
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Redis(redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
        key.to_string(),
    )))
}

#[async_trait::async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(key, |entries, _| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_entries(key, |entries, pending| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: deadline(ttl),
                },
            );
            pending.push(('$', "set", key.to_string()));
            if ttl.is_some() {
                pending.push(('g', "expire", key.to_string()));
            }
        });
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let written = self.with_entries(key, |entries, pending| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: deadline(ttl),
                },
            );
            pending.push(('$', "set", key.to_string()));
            if ttl.is_some() {
                pending.push(('g', "expire", key.to_string()));
            }
            true
        });
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self.with_entries(key, |entries, pending| {
            let existed = entries.remove(key).is_some();
            if existed {
                pending.push(('g', "del", key.to_string()));
            }
            existed
        });
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.with_entries(key, |entries, _| entries.contains_key(key)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let applied = self.with_entries(key, |entries, pending| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = deadline(Some(ttl));
                pending.push(('g', "expire", key.to_string()));
                true
            }
            None => false,
        });
        Ok(applied)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        Ok(self.with_entries(key, |entries, _| {
            entries
                .get(key)
                .and_then(|entry| entry.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        }))
    }

    async fn add_member(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.with_entries(key, |entries, pending| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(BTreeSet::new()),
                expires_at: None,
            });
            let Value::Set(members) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let added = members.insert(member.to_string());
            if added {
                pending.push(('s', "sadd", key.to_string()));
            }
            if ttl.is_some() {
                entry.expires_at = deadline(ttl);
                pending.push(('g', "expire", key.to_string()));
            }
            Ok(added)
        })
    }

    async fn remove_member(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        self.with_entries(key, |entries, pending| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(false);
            };
            let Value::Set(members) = &mut entry.value else {
                return Err(wrong_type(key));
            };
            let removed = members.remove(member);
            if removed {
                pending.push(('s', "srem", key.to_string()));
            }
            if members.is_empty() {
                // Redis never keeps an empty set
                entries.remove(key);
                pending.push(('g', "del", key.to_string()));
            } else if ttl.is_some() {
                entry.expires_at = deadline(ttl);
                pending.push(('g', "expire", key.to_string()));
            }
            Ok(removed)
        })
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries(key, |entries, _| match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.iter().filter(|m| !m.is_empty()).cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn contains_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.with_entries(key, |entries, _| match entries.get(key) {
            None => Ok(false),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members.contains(member)),
            Some(_) => Err(wrong_type(key)),
        })
    }

    async fn replace_members(
        &self,
        key: &str,
        members: &[String],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.with_entries(key, |entries, pending| {
            if entries.remove(key).is_some() {
                pending.push(('g', "del", key.to_string()));
            }
            if !members.is_empty() {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Set(members.iter().cloned().collect()),
                        expires_at: deadline(ttl),
                    },
                );
                pending.push(('s', "sadd", key.to_string()));
            }
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyspaceNotifier for MemoryStore {
    async fn enable_notifications(&self, classes: &str) -> Result<(), StoreError> {
        *self.inner.notify_flags.lock() = classes.to_string();
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<NotificationStream, StoreError> {
        let receiver = self.inner.events.lock().subscribe();
        let pattern = pattern.to_string();

        let ack = Notification {
            kind: MessageKind::Subscribe,
            pattern: None,
            channel: pattern.clone(),
            payload: "1".to_string(),
        };

        let events = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => return Some((event, receiver)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Notification subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .filter_map(move |event| {
            let matched = glob_match(&pattern, &event.channel).then(|| Notification {
                kind: MessageKind::PMessage,
                pattern: Some(pattern.clone()),
                channel: event.channel,
                payload: event.payload,
            });
            future::ready(matched)
        });

        Ok(stream::once(future::ready(ack)).chain(events).boxed())
    }
}

/// Redis-style glob match supporting `*` and `?`
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}
