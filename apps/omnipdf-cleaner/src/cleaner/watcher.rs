//! Expiration/deletion watcher
//!
//! A single background task subscribed to keyspace notifications. For each
//! `del` or `expired` event on a tagged key it runs the matching cleanup
//! handler to completion before reading the next notification, so handlers
//! never run concurrently.
//!
//! Delivery is best-effort. Notifications published while the subscription
//! is down are lost, and a failed handler is logged and not retried.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::WatcherConfig;
use crate::error::StoreError;
use crate::keys::{self, ParsedKey, TaggedKey};
use crate::store::{KeyEvent, KeyspaceNotifier, Notification, NotificationStream};

use super::{Cleanup, CleanupError, CleanupReport, Dispatcher, CLEANUP_EVENTS};

/// Floor for resubscribe delays
const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(1);

/// Watcher lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Stopped,
    Subscribing,
    Listening,
    Stopping,
}

/// Result of one cleanup job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(CleanupReport),
    Failed { error: String },
}

/// A finished cleanup job
#[derive(Debug, Clone, Serialize)]
pub struct CleanupJob {
    pub key: String,
    pub event: String,
    pub outcome: JobOutcome,
    pub finished_at: DateTime<Utc>,
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WatcherStats {
    /// `del`/`expired` notifications seen
    pub received: u64,
    /// Handlers finished, failed ones included
    pub dispatched: u64,
    pub failed: u64,
    pub malformed: u64,
    pub unknown: u64,
    pub reconnects: u64,
}

/// Everything the status endpoint reports
#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub state: WatcherState,
    pub stats: WatcherStats,
    pub recent_jobs: Vec<CleanupJob>,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    unknown: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WatcherStats {
        WatcherStats {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

struct WatcherShared {
    notifier: Arc<dyn KeyspaceNotifier>,
    dispatcher: Dispatcher,
    config: WatcherConfig,
    state: watch::Sender<WatcherState>,
    counters: Counters,
    recent: Mutex<VecDeque<CleanupJob>>,
}

/// Keyspace notification watcher. Restartable after it stops.
pub struct Watcher {
    shared: Arc<WatcherShared>,
    running: tokio::sync::Mutex<Option<WatcherHandle>>,
}

/// Control handle for a running watcher
#[derive(Clone)]
pub struct WatcherHandle {
    shared: Arc<WatcherShared>,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Watcher {
    pub fn new(
        notifier: Arc<dyn KeyspaceNotifier>,
        dispatcher: Dispatcher,
        config: WatcherConfig,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Stopped);
        Self {
            shared: Arc::new(WatcherShared {
                notifier,
                dispatcher,
                config,
                state,
                counters: Counters::default(),
                recent: Mutex::new(VecDeque::new()),
            }),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Enable notifications, subscribe and spawn the listening task.
    ///
    /// Subscription errors are returned here rather than retried; only a
    /// connection lost after a successful start is retried in the background.
    /// Calling `start` on a running watcher returns the existing handle.
    pub async fn start(&self) -> Result<WatcherHandle, StoreError> {
        let mut running = self.running.lock().await;
        if let Some(handle) = running.as_ref() {
            if !handle.is_finished() {
                return Ok(handle.clone());
            }
        }

        self.shared.transition(WatcherState::Subscribing);
        let stream = match self.shared.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.transition(WatcherState::Stopped);
                return Err(e);
            }
        };
        self.shared.transition(WatcherState::Listening);
        tracing::info!(pattern = %self.shared.config.pattern, "Watcher listening");

        let handle = WatcherHandle {
            shared: self.shared.clone(),
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        let shared = self.shared.clone();
        let cancel = handle.cancel.clone();
        let finished = handle.finished.clone();
        tokio::spawn(async move {
            // Releases joiners even if the task panics
            let _finished = finished.drop_guard();
            if let Err(panic) = AssertUnwindSafe(shared.run(stream, cancel))
                .catch_unwind()
                .await
            {
                tracing::error!(panic = %panic_message(&*panic), "Watcher task aborted");
                shared.transition(WatcherState::Stopped);
            }
        });

        *running = Some(handle.clone());
        Ok(handle)
    }

    pub fn state(&self) -> WatcherState {
        *self.shared.state.borrow()
    }

    pub fn stats(&self) -> WatcherStats {
        self.shared.counters.snapshot()
    }

    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            state: self.state(),
            stats: self.stats(),
            recent_jobs: self.shared.recent.lock().iter().cloned().collect(),
        }
    }
}

impl WatcherHandle {
    /// Request shutdown. A handler already running is allowed to finish.
    pub fn stop(&self) {
        if self.is_finished() {
            return;
        }
        self.shared.transition(WatcherState::Stopping);
        self.cancel.cancel();
    }

    /// Wait for the listening task to exit
    pub async fn join(&self) {
        self.finished.cancelled().await;
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    pub fn state(&self) -> WatcherState {
        *self.shared.state.borrow()
    }
}

impl WatcherShared {
    /// Apply a state change. `Stopped` is only left through `Subscribing`,
    /// and `Stopping` only towards `Stopped`.
    fn transition(&self, next: WatcherState) {
        self.state.send_if_modified(|state| {
            let allowed = match (*state, next) {
                (current, next) if current == next => false,
                (WatcherState::Stopping, next) => next == WatcherState::Stopped,
                (WatcherState::Stopped, next) => next == WatcherState::Subscribing,
                _ => true,
            };
            if allowed {
                tracing::debug!(from = ?state, to = ?next, "Watcher state change");
                *state = next;
            }
            allowed
        });
    }

    async fn connect(&self) -> Result<NotificationStream, StoreError> {
        self.notifier
            .enable_notifications(&self.config.notify_classes)
            .await?;
        self.notifier.subscribe(&self.config.pattern).await
    }

    async fn run(&self, mut stream: NotificationStream, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                next = stream.next() => match next {
                    Some(notification) => self.handle_notification(&notification).await,
                    None => {
                        tracing::warn!("Notification stream ended, resubscribing");
                        match self.reconnect(&cancel).await {
                            Some(resumed) => stream = resumed,
                            None => break,
                        }
                    }
                },
            }
        }

        self.transition(WatcherState::Stopping);
        self.transition(WatcherState::Stopped);
        tracing::info!("Watcher stopped");
    }

    /// Resubscribe with exponential backoff until it works or shutdown is requested
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<NotificationStream> {
        self.transition(WatcherState::Subscribing);
        let mut delay = self.config.reconnect_delay.max(MIN_RECONNECT_DELAY);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                attempt = self.connect() => attempt,
            };

            match attempt {
                Ok(stream) => {
                    self.transition(WatcherState::Listening);
                    Counters::bump(&self.counters.reconnects);
                    tracing::info!("Watcher resubscribed");
                    return Some(stream);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Resubscribe failed"
                    );
                    delay = next_delay(delay, self.config.max_reconnect_delay);
                }
            }
        }
    }

    async fn handle_notification(&self, notification: &Notification) {
        let Some(KeyEvent { event, key }) = notification.key_event() else {
            return;
        };
        if !CLEANUP_EVENTS.contains(&event) {
            return;
        }
        Counters::bump(&self.counters.received);

        let tagged = match keys::parse(key) {
            Ok(ParsedKey::Known(tagged)) => tagged,
            Ok(ParsedKey::Unknown { tag, identifier }) => {
                Counters::bump(&self.counters.unknown);
                tracing::warn!(tag = %tag, identifier = %identifier, "No cleanup handler for tag");
                return;
            }
            Err(e) => {
                Counters::bump(&self.counters.malformed);
                tracing::warn!(error = %e, "Dropping malformed key");
                return;
            }
        };

        if tagged.tag().cleanup() == Cleanup::None {
            return;
        }
        self.run_job(event, &tagged).await;
    }

    async fn run_job(&self, event: &str, key: &TaggedKey) {
        tracing::debug!(key = %key, event = %event, "Dispatching cleanup");

        let result = AssertUnwindSafe(self.dispatcher.dispatch(key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(CleanupError::Panicked(panic_message(&*panic))));

        let outcome = match result {
            Ok(report) => {
                tracing::info!(
                    tag = %key.tag(),
                    identifier = %key.identifier(),
                    objects_deleted = report.objects_deleted,
                    entries_deleted = report.entries_deleted,
                    "Cleanup finished"
                );
                JobOutcome::Completed(report)
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                tracing::error!(
                    tag = %key.tag(),
                    identifier = %key.identifier(),
                    error = %e,
                    "Cleanup failed"
                );
                JobOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        self.record(CleanupJob {
            key: key.to_string(),
            event: event.to_string(),
            outcome,
            finished_at: Utc::now(),
        });
        // Bumped after `record`: every counted job is already in `recent`
        Counters::bump(&self.counters.dispatched);
    }

    fn record(&self, job: CleanupJob) {
        let capacity = self.config.recent_jobs;
        if capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock();
        while recent.len() >= capacity {
            recent.pop_front();
        }
        recent.push_back(job);
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    current
        .max(MIN_RECONNECT_DELAY)
        .saturating_mul(2)
        .min(max.max(MIN_RECONNECT_DELAY))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
