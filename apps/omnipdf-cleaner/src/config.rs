//! Configuration management for the OmniPDF cleaner

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::store::{DEFAULT_NOTIFY_CLASSES, DEFAULT_NOTIFY_PATTERN};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub watcher: WatcherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long to wait for the watcher to finish after shutdown is requested
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Lifetime of an idle session
    pub ttl: Duration,
    /// Extra lifetime of association sets beyond the session itself
    pub grace: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Value written to `notify-keyspace-events`
    pub notify_classes: String,
    pub pattern: String,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Number of finished cleanup jobs kept for the status endpoint
    pub recent_jobs: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            cookie_name: "OmniPDFSession".to_string(),
            ttl: Duration::from_secs(24 * 60 * 60),
            grace: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            notify_classes: DEFAULT_NOTIFY_CLASSES.to_string(),
            pattern: DEFAULT_NOTIFY_PATTERN.to_string(),
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(30),
            recent_jobs: 32,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                shutdown_timeout: Duration::from_secs(10),
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            storage: StorageConfig {
                endpoint: "http://minio:9000".to_string(),
                bucket: "omnifiles".to_string(),
                access_key: "admin".to_string(),
                secret_key: "password123".to_string(),
                region: Some("ap-southeast-1".to_string()),
            },
            session: SessionConfig::default(),
            watcher: WatcherConfig::default(),
        }
    }
}

/// Configuration that cannot be loaded
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

/// Parse an optional variable, falling back on absence or bad input
fn env_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    match get(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
        None => default,
    }
}

fn required(get: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<String, ConfigError> {
    get(name).ok_or(ConfigError::Missing(name))
}

impl Config {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from any variable source. Connection settings are required;
    /// everything else falls back to its default one variable at a time.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        Ok(Config {
            server: ServerConfig {
                host: get("SERVER_HOST").unwrap_or(defaults.server.host),
                port: env_or(&get, "SERVER_PORT", defaults.server.port),
                shutdown_timeout: Duration::from_secs(env_or(
                    &get,
                    "SHUTDOWN_TIMEOUT_SECS",
                    defaults.server.shutdown_timeout.as_secs(),
                )),
            },
            redis: RedisConfig {
                url: required(&get, "REDIS_URL")?,
            },
            storage: StorageConfig {
                endpoint: required(&get, "S3_ENDPOINT")?,
                bucket: get("S3_BUCKET").unwrap_or(defaults.storage.bucket),
                access_key: required(&get, "S3_ACCESS_KEY")?,
                secret_key: required(&get, "S3_SECRET_KEY")?,
                region: get("S3_REGION").or(defaults.storage.region),
            },
            session: SessionConfig {
                cookie_name: get("SESSION_COOKIE_NAME").unwrap_or(defaults.session.cookie_name),
                ttl: Duration::from_secs(env_or(
                    &get,
                    "SESSION_TTL_SECS",
                    defaults.session.ttl.as_secs(),
                )),
                grace: Duration::from_secs(env_or(
                    &get,
                    "SESSION_GRACE_SECS",
                    defaults.session.grace.as_secs(),
                )),
            },
            watcher: WatcherConfig {
                notify_classes: get("NOTIFY_KEYSPACE_EVENTS")
                    .unwrap_or(defaults.watcher.notify_classes),
                pattern: get("WATCHER_PATTERN").unwrap_or(defaults.watcher.pattern),
                reconnect_delay: Duration::from_millis(env_or(
                    &get,
                    "WATCHER_RECONNECT_MS",
                    defaults.watcher.reconnect_delay.as_millis() as u64,
                )),
                max_reconnect_delay: Duration::from_millis(env_or(
                    &get,
                    "WATCHER_MAX_RECONNECT_MS",
                    defaults.watcher.max_reconnect_delay.as_millis() as u64,
                )),
                recent_jobs: env_or(&get, "WATCHER_RECENT_JOBS", defaults.watcher.recent_jobs),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.session.cookie_name, "OmniPDFSession");
        assert_eq!(config.watcher.pattern, "__key*__:*");
        assert!(config.session.grace > Duration::ZERO);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("REDIS_URL", "redis://cache:6379"),
        ("S3_ENDPOINT", "http://s3.internal:9000"),
        ("S3_ACCESS_KEY", "key"),
        ("S3_SECRET_KEY", "secret"),
    ];

    #[test]
    fn test_env_or_falls_back() {
        let get = lookup(&[("SERVER_PORT", "not-a-port")]);
        assert_eq!(env_or(&get, "OMNIPDF_CLEANER_TEST_UNSET", 7u16), 7);
        assert_eq!(env_or(&get, "SERVER_PORT", 8000u16), 8000);
    }

    #[test]
    fn test_partial_environment_names_missing_variable() {
        let err = Config::from_lookup(lookup(&REQUIRED[..3])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("S3_SECRET_KEY")));
        assert!(err.to_string().contains("S3_SECRET_KEY"));
    }

    #[test]
    fn test_set_variables_are_kept() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("SERVER_PORT", "nope"),
            ("S3_BUCKET", "docs"),
            ("SESSION_TTL_SECS", "120"),
            ("WATCHER_RECONNECT_MS", "0"),
        ]);
        let config = Config::from_lookup(lookup(&vars)).unwrap();

        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.storage.endpoint, "http://s3.internal:9000");
        assert_eq!(config.storage.secret_key, "secret");
        assert_eq!(config.storage.bucket, "docs");
        assert_eq!(config.session.ttl, Duration::from_secs(120));
        assert_eq!(config.watcher.reconnect_delay, Duration::ZERO);
        // Invalid value falls back without discarding the rest
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.session.grace, Config::default().session.grace);
    }
}
