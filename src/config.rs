//! Application configuration
//!
//! `AppConfig` comes from the environment (a `.env` file is honoured via
//! `dotenvy` in [`crate::run`]). `SyncPolicy` is user-tunable and persisted in
//! the settings table.

use crate::db::Database;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8080/api/v1";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DB_FILE_NAME: &str = "dashboard.db";
const SYNC_POLICY_KEY: &str = "sync_policy";

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub database_path: PathBuf,
    pub http_timeout: Duration,
    pub log_level: String,
    pub start_online: bool,
}

impl AppConfig {
    /// Load configuration from `ARTICLE_DASHBOARD_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("ARTICLE_DASHBOARD_API_URL")
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        url::Url::parse(&api_url)
            .map_err(|e| ConfigError::Invalid("ARTICLE_DASHBOARD_API_URL", e.to_string()))?;

        let database_path = match lookup("ARTICLE_DASHBOARD_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_database_path()?,
        };

        let http_timeout = match lookup("ARTICLE_DASHBOARD_HTTP_TIMEOUT_SECS") {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| {
                    ConfigError::Invalid("ARTICLE_DASHBOARD_HTTP_TIMEOUT_SECS", raw.clone())
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid(
                        "ARTICLE_DASHBOARD_HTTP_TIMEOUT_SECS",
                        "must be at least 1".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        };

        let start_online = match lookup("ARTICLE_DASHBOARD_START_ONLINE") {
            Some(raw) => parse_bool(&raw)
                .ok_or(ConfigError::Invalid("ARTICLE_DASHBOARD_START_ONLINE", raw))?,
            None => true,
        };

        Ok(Self {
            api_url,
            api_token: lookup("ARTICLE_DASHBOARD_API_TOKEN").filter(|t| !t.is_empty()),
            database_path,
            http_timeout,
            log_level: lookup("ARTICLE_DASHBOARD_LOG").unwrap_or_else(|| "info".to_string()),
            start_online,
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn default_database_path() -> Result<PathBuf, ConfigError> {
    directories::ProjectDirs::from("com", "ArticleDashboard", "article-dashboard")
        .map(|dirs| dirs.data_dir().join(DB_FILE_NAME))
        .ok_or(ConfigError::NoDataDir)
}

/// Retry and backoff policy for replaying queued mutations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Failed replays allowed before an item is dropped as a permanent failure
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl SyncPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "max_retries",
                "must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Invalid(
                "base_delay_ms",
                format!(
                    "{} exceeds max_delay_ms {}",
                    self.base_delay_ms, self.max_delay_ms
                ),
            ));
        }
        Ok(())
    }

    /// Delay to wait once an item has failed `retry_count` times: `base * 2^n`, capped
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2_u64.saturating_pow(retry_count);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        Duration::from_millis(delay_ms)
    }

    /// Load the persisted policy, falling back to defaults
    pub fn load(db: &Database) -> Result<Self, ConfigError> {
        let policy: SyncPolicy = db
            .get_setting(SYNC_POLICY_KEY)
            .map_err(|e| ConfigError::Storage(e.to_string()))?
            .unwrap_or_default();

        policy.validate()?;
        Ok(policy)
    }

    pub fn save(&self, db: &Database) -> Result<(), ConfigError> {
        self.validate()?;
        db.set_setting(SYNC_POLICY_KEY, self)
            .map_err(|e| ConfigError::Storage(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),

    #[error("Could not determine a data directory for the database")]
    NoDataDir,

    #[error("Settings storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_config_from_lookup() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("ARTICLE_DASHBOARD_API_URL", "https://api.example.com/v1"),
            ("ARTICLE_DASHBOARD_DB_PATH", "/tmp/dash.db"),
            ("ARTICLE_DASHBOARD_HTTP_TIMEOUT_SECS", "5"),
            ("ARTICLE_DASHBOARD_START_ONLINE", "no"),
            ("ARTICLE_DASHBOARD_API_TOKEN", ""),
        ]))
        .unwrap();

        assert_eq!(config.api_url, "https://api.example.com/v1");
        assert_eq!(config.database_path, PathBuf::from("/tmp/dash.db"));
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert!(!config.start_online);
        assert!(config.api_token.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let result = AppConfig::from_lookup(lookup_from(&[
            ("ARTICLE_DASHBOARD_DB_PATH", "/tmp/dash.db"),
            ("ARTICLE_DASHBOARD_HTTP_TIMEOUT_SECS", "soon"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));

        let result = AppConfig::from_lookup(lookup_from(&[
            ("ARTICLE_DASHBOARD_DB_PATH", "/tmp/dash.db"),
            ("ARTICLE_DASHBOARD_API_URL", "not a url"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid(_, _))));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = SyncPolicy::default();

        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(60));
    }

    #[test]
    fn test_policy_persistence() {
        let db = Database::in_memory().unwrap();
        assert_eq!(SyncPolicy::load(&db).unwrap(), SyncPolicy::default());

        let policy = SyncPolicy {
            max_retries: 5,
            base_delay_ms: 250,
            max_delay_ms: 10_000,
        };
        policy.save(&db).unwrap();
        assert_eq!(SyncPolicy::load(&db).unwrap(), policy);

        let invalid = SyncPolicy {
            max_retries: 0,
            ..policy
        };
        assert!(invalid.save(&db).is_err());
    }
}
