//! Persistence store: subscription records and the per-subscription
//! posted-item journal, backed by `sqlx::SqlitePool`.
//!
//! Raw-query style (`sqlx::query`, `sqlx::query_scalar`, `anyhow::Context`)
//! reworked around the subscription/journal schema this system needs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Row, SqlitePool};
use tracing::{info, warn};

use crate::error::CoreError;
use crate::model::{Subscription, SubscriptionState};

/// A value to assign to one named field via `update_state`.
#[derive(Debug, Clone)]
pub enum StateValue {
    Text(Option<String>),
    Timestamp(Option<DateTime<Utc>>),
    Int(i64),
}

#[derive(FromRow)]
struct SubscriptionRow {
    id: i64,
    feed_url: String,
    display_name: String,
    channel_id: String,
    server_id: String,
    added_by: String,
    created_at: DateTime<Utc>,
    etag: Option<String>,
    last_modified: Option<String>,
    last_poll_at: Option<DateTime<Utc>>,
    next_poll_at: Option<DateTime<Utc>>,
    poll_interval: i64,
    consecutive_errors: i64,
    last_error: Option<String>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            feed_url: row.feed_url,
            display_name: row.display_name,
            channel_id: row.channel_id,
            server_id: row.server_id,
            added_by: row.added_by,
            created_at: row.created_at,
            state: SubscriptionState {
                etag: row.etag,
                last_modified: row.last_modified,
                last_poll_at: row.last_poll_at,
                next_poll_at: row.next_poll_at,
                poll_interval: row.poll_interval,
                consecutive_errors: row.consecutive_errors,
                last_error: row.last_error,
            },
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, feed_url, display_name, channel_id, server_id, added_by, \
     created_at, etag, last_modified, last_poll_at, next_poll_at, poll_interval, \
     consecutive_errors, last_error";

/// Create the schema if missing, and migrate a legacy `feed_state` sidecar
/// table into the unified `subscriptions` layout if one is found. Safe to
/// call on every startup: once migrated, the sidecar no longer exists and
/// this becomes a no-op.
pub async fn initialise(pool: &SqlitePool, default_interval: i64) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            feed_url      TEXT NOT NULL,
            display_name  TEXT NOT NULL,
            channel_id    TEXT NOT NULL,
            server_id     TEXT NOT NULL,
            added_by      TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            etag               TEXT,
            last_modified      TEXT,
            last_poll_at       TEXT,
            next_poll_at       TEXT,
            poll_interval      INTEGER NOT NULL DEFAULT 900,
            consecutive_errors INTEGER NOT NULL DEFAULT 0,
            last_error         TEXT,
            UNIQUE(feed_url, server_id)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create subscriptions table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posted_items (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
            item_guid       TEXT NOT NULL,
            posted_at       TEXT NOT NULL,
            message_id      TEXT,
            UNIQUE(subscription_id, item_guid)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create posted_items table")?;

    migrate_legacy_feed_state(pool, default_interval).await?;

    Ok(())
}

/// Copies polling state out of a legacy `feeds` + `feed_state` sidecar
/// layout (see `original_source/cordfeeder/database.py`) into the unified
/// `subscriptions` table, then drops the sidecar. A no-op if `feed_state`
/// doesn't exist.
async fn migrate_legacy_feed_state(pool: &SqlitePool, default_interval: i64) -> Result<()> {
    let sidecar_exists: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='table' AND name='feed_state'",
    )
    .fetch_optional(pool)
    .await
    .context("failed to probe for legacy feed_state table")?;

    if sidecar_exists.is_none() {
        return Ok(());
    }

    let legacy_feeds_exists: Option<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' AND name='feeds'")
            .fetch_optional(pool)
            .await
            .context("failed to probe for legacy feeds table")?;

    if legacy_feeds_exists.is_none() {
        // Nothing to migrate from; just drop the orphaned sidecar.
        sqlx::query("DROP TABLE feed_state")
            .execute(pool)
            .await
            .context("failed to drop orphaned feed_state table")?;
        return Ok(());
    }

    info!("legacy feed_state sidecar table found, migrating into unified subscriptions layout");

    let mut tx = pool
        .begin()
        .await
        .context("failed to start migration transaction")?;

    let legacy_rows = sqlx::query(
        r#"
        SELECT f.id, f.url, f.name, f.channel_id, f.guild_id, f.added_by, f.created_at,
               s.etag, s.last_modified, s.last_poll_at, s.next_poll_at,
               s.poll_interval, s.consecutive_errors, s.last_error
        FROM feeds f
        LEFT JOIN feed_state s ON s.feed_id = f.id
        "#,
    )
    .fetch_all(&mut *tx)
    .await
    .context("failed to read legacy feeds/feed_state rows")?;

    for row in legacy_rows {
        let id: i64 = row.try_get("id")?;
        let url: String = row.try_get("url")?;
        let name: String = row.try_get("name")?;
        // The legacy schema stores these as Discord snowflake integers
        // (see original_source/cordfeeder/database.py); the unified schema
        // treats them as opaque string identifiers.
        let channel_id: String = row.try_get::<i64, _>("channel_id")?.to_string();
        let guild_id: String = row.try_get::<i64, _>("guild_id")?.to_string();
        let added_by: String = row.try_get::<i64, _>("added_by")?.to_string();
        let created_at: DateTime<Utc> = row
            .try_get("created_at")
            .unwrap_or_else(|_| Utc::now());

        let poll_interval: i64 = row.try_get("poll_interval").unwrap_or(default_interval);

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO subscriptions
                (id, feed_url, display_name, channel_id, server_id, added_by, created_at,
                 etag, last_modified, last_poll_at, next_poll_at, poll_interval,
                 consecutive_errors, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(&url)
        .bind(&name)
        .bind(&channel_id)
        .bind(&guild_id)
        .bind(&added_by)
        .bind(created_at)
        .bind(row.try_get::<Option<String>, _>("etag").ok().flatten())
        .bind(row.try_get::<Option<String>, _>("last_modified").ok().flatten())
        .bind(row.try_get::<Option<DateTime<Utc>>, _>("last_poll_at").ok().flatten())
        .bind(row.try_get::<Option<DateTime<Utc>>, _>("next_poll_at").ok().flatten())
        .bind(poll_interval)
        .bind(row.try_get::<i64, _>("consecutive_errors").unwrap_or(0))
        .bind(row.try_get::<Option<String>, _>("last_error").ok().flatten())
        .execute(&mut *tx)
        .await
        .context("failed to insert migrated subscription row")?;
    }

    sqlx::query("DROP TABLE feed_state")
        .execute(&mut *tx)
        .await
        .context("failed to drop legacy feed_state table")?;

    tx.commit().await.context("failed to commit migration")?;

    warn!("legacy feed_state table migrated and dropped");
    Ok(())
}

pub async fn add_subscription(
    pool: &SqlitePool,
    feed_url: &str,
    display_name: &str,
    channel_id: &str,
    server_id: &str,
    added_by: &str,
    default_interval: i64,
) -> Result<i64> {
    let existing: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM subscriptions WHERE feed_url = ? AND server_id = ?",
    )
    .bind(feed_url)
    .bind(server_id)
    .fetch_optional(pool)
    .await
    .context("failed to check for existing subscription")?;

    if existing.is_some() {
        return Err(CoreError::DuplicateSubscription.into());
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO subscriptions
            (feed_url, display_name, channel_id, server_id, added_by, created_at, poll_interval)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(feed_url)
    .bind(display_name)
    .bind(channel_id)
    .bind(server_id)
    .bind(added_by)
    .bind(Utc::now())
    .bind(default_interval)
    .fetch_one(pool)
    .await
    .context("failed to insert subscription")?;

    info!(subscription_id = id, feed_url, "subscription added");
    Ok(id)
}

pub async fn remove_subscription(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM subscriptions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("failed to remove subscription {id}"))?;
    Ok(())
}

pub async fn get_subscription(pool: &SqlitePool, id: i64) -> Result<Option<Subscription>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch subscription")?;
    Ok(row.map(Into::into))
}

pub async fn get_subscription_by_url(
    pool: &SqlitePool,
    feed_url: &str,
    server_id: &str,
) -> Result<Option<Subscription>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE feed_url = ? AND server_id = ?"
    ))
    .bind(feed_url)
    .bind(server_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch subscription by url")?;
    Ok(row.map(Into::into))
}

pub async fn list_subscriptions(pool: &SqlitePool, server_id: &str) -> Result<Vec<Subscription>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE server_id = ? ORDER BY display_name ASC"
    ))
    .bind(server_id)
    .fetch_all(pool)
    .await
    .context("failed to list subscriptions")?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn update_channel(pool: &SqlitePool, id: i64, channel_id: &str) -> Result<()> {
    sqlx::query("UPDATE subscriptions SET channel_id = ? WHERE id = ?")
        .bind(channel_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update subscription channel")?;
    Ok(())
}

pub async fn update_url(pool: &SqlitePool, id: i64, feed_url: &str) -> Result<()> {
    sqlx::query("UPDATE subscriptions SET feed_url = ? WHERE id = ?")
        .bind(feed_url)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update subscription url")?;
    Ok(())
}

pub async fn get_state(pool: &SqlitePool, id: i64) -> Result<Option<SubscriptionState>> {
    Ok(get_subscription(pool, id).await?.map(|s| s.state))
}

/// Applies a partial update to a subscription's polling state. Unknown
/// field names are rejected with `CoreError::UnknownStateField`.
pub async fn update_state(pool: &SqlitePool, id: i64, fields: &[(&str, StateValue)]) -> Result<()> {
    const KNOWN: &[&str] = &[
        "etag",
        "last_modified",
        "last_poll_at",
        "next_poll_at",
        "poll_interval",
        "consecutive_errors",
        "last_error",
    ];

    for (name, _) in fields {
        if !KNOWN.contains(name) {
            return Err(CoreError::UnknownStateField((*name).to_string()).into());
        }
    }

    if fields.is_empty() {
        return Ok(());
    }

    let mut set_clauses = Vec::with_capacity(fields.len());
    let mut query = String::from("UPDATE subscriptions SET ");
    for (name, _) in fields {
        set_clauses.push(format!("{name} = ?"));
    }
    query.push_str(&set_clauses.join(", "));
    query.push_str(" WHERE id = ?");

    let mut q = sqlx::query(&query);
    for (_, value) in fields {
        q = match value {
            StateValue::Text(v) => q.bind(v.clone()),
            StateValue::Timestamp(v) => q.bind(*v),
            StateValue::Int(v) => q.bind(*v),
        };
    }
    q = q.bind(id);

    q.execute(pool)
        .await
        .with_context(|| format!("failed to update state for subscription {id}"))?;

    Ok(())
}

pub async fn record_posted(
    pool: &SqlitePool,
    subscription_id: i64,
    item_guid: &str,
    message_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO posted_items (subscription_id, item_guid, posted_at, message_id)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(subscription_id)
    .bind(item_guid)
    .bind(Utc::now())
    .bind(message_id)
    .execute(pool)
    .await
    .context("failed to record posted item")?;
    Ok(())
}

pub async fn is_posted(pool: &SqlitePool, subscription_id: i64, item_guid: &str) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM posted_items WHERE subscription_id = ? AND item_guid = ?",
    )
    .bind(subscription_id)
    .bind(item_guid)
    .fetch_optional(pool)
    .await
    .context("failed to check posted status")?;
    Ok(found.is_some())
}

/// Returns the subset of `item_guids` already journalled for `subscription_id`.
pub async fn posted_subset(
    pool: &SqlitePool,
    subscription_id: i64,
    item_guids: &[String],
) -> Result<std::collections::HashSet<String>> {
    if item_guids.is_empty() {
        return Ok(std::collections::HashSet::new());
    }

    let placeholders = item_guids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let query = format!(
        "SELECT item_guid FROM posted_items WHERE subscription_id = ? AND item_guid IN ({placeholders})"
    );

    let mut q = sqlx::query_scalar::<_, String>(&query).bind(subscription_id);
    for guid in item_guids {
        q = q.bind(guid);
    }

    let rows = q
        .fetch_all(pool)
        .await
        .context("failed to fetch posted subset")?;
    Ok(rows.into_iter().collect())
}

pub async fn due_subscriptions(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
        r#"
        SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
        WHERE next_poll_at IS NULL OR next_poll_at <= ?
        ORDER BY next_poll_at ASC
        "#
    ))
    .bind(now)
    .fetch_all(pool)
    .await
    .context("failed to fetch due subscriptions")?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn prune_journal(pool: &SqlitePool, older_than_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
    let result = sqlx::query("DELETE FROM posted_items WHERE posted_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to prune journal")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        initialise(&pool, 900).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn add_and_get_subscription_roundtrips() {
        let pool = test_pool().await;
        let id = add_subscription(&pool, "https://example.com/feed", "Example", "chan", "srv", "admin", 900)
            .await
            .unwrap();
        let sub = get_subscription(&pool, id).await.unwrap().unwrap();
        assert_eq!(sub.feed_url, "https://example.com/feed");
        assert_eq!(sub.state.poll_interval, 900);
        assert_eq!(sub.state.consecutive_errors, 0);
        assert!(sub.state.next_poll_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let pool = test_pool().await;
        add_subscription(&pool, "https://example.com/feed", "Example", "chan", "srv", "admin", 900)
            .await
            .unwrap();
        let err = add_subscription(&pool, "https://example.com/feed", "Example", "chan", "srv", "admin", 900)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<CoreError>().is_some());
    }

    #[tokio::test]
    async fn remove_subscription_cascades_to_journal() {
        let pool = test_pool().await;
        let id = add_subscription(&pool, "https://example.com/feed", "Example", "chan", "srv", "admin", 900)
            .await
            .unwrap();
        record_posted(&pool, id, "guid-1", None).await.unwrap();
        remove_subscription(&pool, id).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posted_items WHERE subscription_id = ?")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn update_state_rejects_unknown_field() {
        let pool = test_pool().await;
        let id = add_subscription(&pool, "https://example.com/feed", "Example", "chan", "srv", "admin", 900)
            .await
            .unwrap();
        let err = update_state(&pool, id, &[("bogus_field", StateValue::Int(1))])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::UnknownStateField(_))
        ));
    }

    #[tokio::test]
    async fn posted_subset_returns_only_known_guids() {
        let pool = test_pool().await;
        let id = add_subscription(&pool, "https://example.com/feed", "Example", "chan", "srv", "admin", 900)
            .await
            .unwrap();
        record_posted(&pool, id, "guid-1", None).await.unwrap();
        let subset = posted_subset(
            &pool,
            id,
            &["guid-1".to_string(), "guid-2".to_string()],
        )
        .await
        .unwrap();
        assert!(subset.contains("guid-1"));
        assert!(!subset.contains("guid-2"));
    }

    #[tokio::test]
    async fn due_subscriptions_orders_absent_first() {
        let pool = test_pool().await;
        let first = add_subscription(&pool, "https://a.example/feed", "A", "chan", "srv", "admin", 900)
            .await
            .unwrap();
        let second = add_subscription(&pool, "https://b.example/feed", "B", "chan", "srv", "admin", 900)
            .await
            .unwrap();
        update_state(
            &pool,
            second,
            &[("next_poll_at", StateValue::Timestamp(Some(Utc::now())))],
        )
        .await
        .unwrap();

        let due = due_subscriptions(&pool, Utc::now()).await.unwrap();
        assert_eq!(due[0].id, first);
    }

    #[tokio::test]
    async fn migration_is_idempotent_when_no_legacy_table_exists() {
        let pool = test_pool().await;
        initialise(&pool, 900).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn legacy_feed_state_sidecar_migrates_into_unified_table() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE feeds (
                id INTEGER PRIMARY KEY,
                url TEXT NOT NULL,
                name TEXT NOT NULL,
                channel_id INTEGER NOT NULL,
                guild_id INTEGER NOT NULL,
                added_by INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE feed_state (
                feed_id INTEGER PRIMARY KEY REFERENCES feeds(id) ON DELETE CASCADE,
                etag TEXT,
                last_modified TEXT,
                last_poll_at TEXT,
                next_poll_at TEXT,
                poll_interval INTEGER NOT NULL DEFAULT 900,
                consecutive_errors INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO feeds (id, url, name, channel_id, guild_id, added_by, created_at) \
             VALUES (1, 'https://example.com/feed', 'Example', 111, 222, 333, ?)",
        )
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO feed_state (feed_id, poll_interval, consecutive_errors) VALUES (1, 1800, 2)",
        )
        .execute(&pool)
        .await
        .unwrap();

        initialise(&pool, 900).await.unwrap();

        let sub = get_subscription(&pool, 1).await.unwrap().unwrap();
        assert_eq!(sub.state.poll_interval, 1800);
        assert_eq!(sub.state.consecutive_errors, 2);
        assert_eq!(sub.channel_id, "111");
        assert_eq!(sub.server_id, "222");
        assert_eq!(sub.added_by, "333");

        let sidecar_gone: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='feed_state'",
        )
        .fetch_optional(&pool)
        .await
        .unwrap();
        assert!(sidecar_gone.is_none());

        // Re-running initialise is now a no-op.
        initialise(&pool, 900).await.unwrap();
        let sub_again = get_subscription(&pool, 1).await.unwrap().unwrap();
        assert_eq!(sub_again.state.poll_interval, 1800);
    }
}
