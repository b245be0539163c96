/*!
common/src/lib.rs

Shared configuration and SQLite bootstrap helpers for feedkeeper.

This crate provides:
- `Config`, loaded from environment variables at startup and treated as
  immutable for the remainder of the process's life.
- `init_db_pool`, which opens (creating if necessary) the SQLite database
  the feed-polling engine persists subscriptions and the posted-item
  journal into.
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::env;
use std::path::Path;
use std::str::FromStr;

/// Top-level application configuration, sourced entirely from the process
/// environment. None of these values change after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Credential for the chat platform the command facade talks to.
    /// Never logged in full — use [`Config::redacted_summary`].
    pub chat_token: String,
    pub database_path: String,
    pub log_level: String,
    pub default_poll_interval: i64,
    pub min_poll_interval: i64,
    pub max_poll_interval: i64,
    pub max_items_per_poll: usize,
    pub initial_items_count: usize,
    pub user_agent: String,
}

impl Config {
    /// Load configuration from `FEEDKEEPER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let chat_token = env::var("FEEDKEEPER_CHAT_TOKEN")
            .context("FEEDKEEPER_CHAT_TOKEN environment variable is required")?;

        let cfg = Config {
            chat_token,
            database_path: env_or("FEEDKEEPER_DATABASE_PATH", "feedkeeper.db"),
            log_level: env_or("FEEDKEEPER_LOG_LEVEL", "info"),
            default_poll_interval: env_parsed_or("FEEDKEEPER_DEFAULT_POLL_INTERVAL", 900)?,
            min_poll_interval: env_parsed_or("FEEDKEEPER_MIN_POLL_INTERVAL", 300)?,
            max_poll_interval: env_parsed_or("FEEDKEEPER_MAX_POLL_INTERVAL", 43_200)?,
            max_items_per_poll: env_parsed_or("FEEDKEEPER_MAX_ITEMS_PER_POLL", 5)?,
            initial_items_count: env_parsed_or("FEEDKEEPER_INITIAL_ITEMS_COUNT", 3)?,
            user_agent: env_or("FEEDKEEPER_USER_AGENT", "feedkeeper/0.1"),
        };

        anyhow::ensure!(
            cfg.min_poll_interval <= cfg.max_poll_interval,
            "FEEDKEEPER_MIN_POLL_INTERVAL must be <= FEEDKEEPER_MAX_POLL_INTERVAL"
        );
        anyhow::ensure!(
            cfg.default_poll_interval >= cfg.min_poll_interval
                && cfg.default_poll_interval <= cfg.max_poll_interval,
            "FEEDKEEPER_DEFAULT_POLL_INTERVAL must fall within [min, max] interval bounds"
        );

        Ok(cfg)
    }

    /// A log-safe rendering of the configuration: the chat credential is
    /// redacted to its length, everything else is printed verbatim.
    pub fn redacted_summary(&self) -> String {
        format!(
            "database_path={} log_level={} default_poll_interval={} min_poll_interval={} \
             max_poll_interval={} max_items_per_poll={} initial_items_count={} user_agent={} \
             chat_token=<redacted, {} chars>",
            self.database_path,
            self.log_level,
            self.default_poll_interval,
            self.min_poll_interval,
            self.max_poll_interval,
            self.max_items_per_poll,
            self.initial_items_count,
            self.user_agent,
            self.chat_token.len(),
        )
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed_or<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is not valid: {e}")),
        Err(_) => Ok(default),
    }
}

/// Initialize a SQLite connection pool at `path`, creating the file and its
/// parent directory if they don't already exist.
///
/// Schema creation and the legacy sidecar-table migration are the caller's
/// responsibility (see `feedkeeper::store::Store::initialise`) — this
/// helper only opens the connection.
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to sqlite database at path: {path}"))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn config_from_env_applies_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("FEEDKEEPER_CHAT_TOKEN", "test-token");
        env::remove_var("FEEDKEEPER_DATABASE_PATH");
        env::remove_var("FEEDKEEPER_DEFAULT_POLL_INTERVAL");

        let cfg = Config::from_env().expect("config should load");
        assert_eq!(cfg.database_path, "feedkeeper.db");
        assert_eq!(cfg.default_poll_interval, 900);
        assert_eq!(cfg.min_poll_interval, 300);
        assert_eq!(cfg.max_poll_interval, 43_200);

        env::remove_var("FEEDKEEPER_CHAT_TOKEN");
    }

    #[test]
    fn config_requires_chat_token() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("FEEDKEEPER_CHAT_TOKEN");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn redacted_summary_never_contains_token() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("FEEDKEEPER_CHAT_TOKEN", "super-secret-value");
        let cfg = Config::from_env().expect("config should load");
        assert!(!cfg.redacted_summary().contains("super-secret-value"));
        env::remove_var("FEEDKEEPER_CHAT_TOKEN");
    }

    #[tokio::test]
    async fn init_db_pool_creates_file_and_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("feedkeeper.db");
        let pool = init_db_pool(db_path.to_str().unwrap()).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        drop(conn);
        assert!(db_path.exists());
    }
}
