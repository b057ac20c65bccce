//! Application state management

use std::sync::Arc;

use crate::cleaner::Watcher;
use crate::config::Config;
use crate::session::SessionStore;
use crate::store::KeyedStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: Arc<dyn KeyedStore>,
    sessions: SessionStore,
    watcher: Arc<Watcher>,
}

impl AppState {
    pub fn new(
        config: Config,
        store: Arc<dyn KeyedStore>,
        sessions: SessionStore,
        watcher: Arc<Watcher>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                sessions,
                watcher,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Raw keyed store, for scheduling cleanup flags
    pub fn store(&self) -> Arc<dyn KeyedStore> {
        self.inner.store.clone()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn watcher(&self) -> &Watcher {
        &self.inner.watcher
    }
}
