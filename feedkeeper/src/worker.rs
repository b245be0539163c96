//! Per-feed worker: orchestrates one poll cycle for a single subscription.
//! Grounded in `original_source/cordfeeder/poller.py`'s `_poll_feed` /
//! `_post_item` / `_schedule_next_poll` / `calculate_adaptive_interval`.

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::fetch::{self, FetchOutcome, HostSemaphores};
use crate::model::{ParsedItem, Subscription};
use crate::parser;
use crate::sink::PublisherSink;
use crate::store::{self, StateValue};

/// Subscriptions within `WARMUP_INTERVAL_MULTIPLIER * default_interval` of
/// their creation always use the default interval: a handful of early
/// items from a freshly-discovered feed is not a reliable cadence signal.
const WARMUP_INTERVAL_MULTIPLIER: i64 = 3;
const RATE_LIMIT_MIN_BACKOFF_SECS: i64 = 14_400;
const MAX_ERROR_BACKOFF_SECS: f64 = 86_400.0;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub max_items_per_poll: usize,
    pub min_interval: i64,
    pub max_interval: i64,
    pub default_interval: i64,
    pub user_agent: String,
}

/// Runs one poll cycle for `subscription` to completion. Never returns an
/// error for feed-level failures (410, rate limit, server error, parse
/// failure, …) — those are handled and persisted internally, matching the
/// rule that worker-level failures never escape to the scheduler. Only a
/// persistence-layer failure propagates.
pub async fn poll_subscription(
    pool: &SqlitePool,
    client: &Client,
    semaphores: &HostSemaphores,
    sink: &dyn PublisherSink,
    config: &WorkerConfig,
    subscription: Subscription,
) -> anyhow::Result<()> {
    let outcome = fetch::fetch(
        client,
        semaphores,
        &subscription.feed_url,
        subscription.state.etag.as_deref(),
        subscription.state.last_modified.as_deref(),
        &config.user_agent,
    )
    .await;

    match outcome {
        Ok(FetchOutcome::NotModified) => {
            handle_not_modified(pool, subscription.id, subscription.state.poll_interval).await
        }
        Ok(FetchOutcome::Fresh {
            body,
            etag,
            last_modified,
        }) => handle_fresh(pool, sink, config, &subscription, body, etag, last_modified).await,
        Err(CoreError::PermanentGone) => {
            warn!(subscription_id = subscription.id, feed_url = %subscription.feed_url, "feed is gone (410), removing subscription");
            handle_permanent_gone(
                pool,
                sink,
                subscription.id,
                &subscription.display_name,
                &subscription.feed_url,
                &subscription.channel_id,
            )
            .await
        }
        Err(CoreError::RateLimited { retry_after_secs }) => {
            warn!(subscription_id = subscription.id, ?retry_after_secs, "feed rate limited");
            handle_rate_limited(pool, subscription.id, retry_after_secs).await
        }
        Err(other) => {
            warn!(subscription_id = subscription.id, error = %other, "feed fetch failed");
            apply_feed_error(pool, &subscription, &other.to_string()).await
        }
    }
}

async fn handle_not_modified(pool: &SqlitePool, id: i64, poll_interval: i64) -> anyhow::Result<()> {
    let now = Utc::now();
    let next_poll_at = now + chrono::Duration::seconds(poll_interval);
    store::update_state(
        pool,
        id,
        &[
            ("consecutive_errors", StateValue::Int(0)),
            ("last_poll_at", StateValue::Timestamp(Some(now))),
            ("next_poll_at", StateValue::Timestamp(Some(next_poll_at))),
        ],
    )
    .await
}

async fn handle_fresh(
    pool: &SqlitePool,
    sink: &dyn PublisherSink,
    config: &WorkerConfig,
    subscription: &Subscription,
    body: Vec<u8>,
    etag: Option<String>,
    last_modified: Option<String>,
) -> anyhow::Result<()> {
    let id = subscription.id;

    let (_, items) = match parser::parse_feed(&body) {
        Ok(parsed) => parsed,
        Err(e) => return apply_feed_error(pool, subscription, &e.to_string()).await,
    };

    let guids: Vec<String> = items.iter().map(|i| i.guid.clone()).collect();
    let already_posted = store::posted_subset(pool, id, &guids).await?;

    let new_items: Vec<&ParsedItem> = items
        .iter()
        .filter(|i| !already_posted.contains(&i.guid))
        .collect();

    // Keep the most recent N (items are latest-first by document order),
    // then reverse so the sink receives them oldest-first.
    let mut to_post: Vec<&ParsedItem> = new_items
        .into_iter()
        .take(config.max_items_per_poll)
        .collect();
    to_post.reverse();

    for item in &to_post {
        deliver_item(
            pool,
            sink,
            id,
            &subscription.channel_id,
            &subscription.display_name,
            item,
        )
        .await?;
    }

    let timestamps: Vec<DateTime<Utc>> = items
        .iter()
        .filter_map(|i| i.published.as_deref())
        .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .collect();

    let age = Utc::now() - subscription.created_at;
    let in_warmup = age < chrono::Duration::seconds(config.default_interval * WARMUP_INTERVAL_MULTIPLIER);

    let interval = if in_warmup {
        config.default_interval
    } else {
        calculate_adaptive_interval(timestamps, config.min_interval, config.max_interval)
            .unwrap_or(subscription.state.poll_interval)
    }
    .clamp(config.min_interval, config.max_interval);

    info!(subscription_id = id, new_items = to_post.len(), next_interval = interval, "poll complete");

    schedule_success(pool, id, etag, last_modified, interval).await
}

async fn deliver_item(
    pool: &SqlitePool,
    sink: &dyn PublisherSink,
    subscription_id: i64,
    channel_id: &str,
    display_name: &str,
    item: &ParsedItem,
) -> anyhow::Result<()> {
    let message_id = if sink.resolve_channel(channel_id).await {
        let rendered = render_item(display_name, item);
        sink.post(channel_id, &rendered).await
    } else {
        warn!(subscription_id, channel_id, "channel not found, skipping send but journaling item");
        None
    };

    // Recorded whether or not the sink succeeded: the core's at-most-once
    // delivery invariant depends on this write happening unconditionally.
    store::record_posted(pool, subscription_id, &item.guid, message_id.as_deref()).await?;
    Ok(())
}

/// Minimal plain-text rendering for the reference `LoggingSink`. A real
/// chat-platform adapter is expected to do its own formatting and mention
/// neutralization downstream — the core passes the raw title/summary
/// through unaltered.
fn render_item(display_name: &str, item: &ParsedItem) -> String {
    match &item.link {
        Some(link) => format!("[{display_name}] {}\n{link}", item.title),
        None => format!("[{display_name}] {}", item.title),
    }
}

async fn handle_permanent_gone(
    pool: &SqlitePool,
    sink: &dyn PublisherSink,
    id: i64,
    display_name: &str,
    feed_url: &str,
    channel_id: &str,
) -> anyhow::Result<()> {
    let notice =
        format!("Feed \"{display_name}\" ({feed_url}) returned HTTP 410 Gone. Removing it automatically.");
    sink.notify_removed(channel_id, &notice).await;
    store::remove_subscription(pool, id).await?;
    Ok(())
}

async fn handle_rate_limited(pool: &SqlitePool, id: i64, retry_after_secs: Option<i64>) -> anyhow::Result<()> {
    let backoff = std::cmp::max(retry_after_secs.unwrap_or(0), RATE_LIMIT_MIN_BACKOFF_SECS);
    let next_poll_at = Utc::now() + chrono::Duration::seconds(backoff);
    store::update_state(
        pool,
        id,
        &[("next_poll_at", StateValue::Timestamp(Some(next_poll_at)))],
    )
    .await
}

async fn apply_feed_error(pool: &SqlitePool, subscription: &Subscription, message: &str) -> anyhow::Result<()> {
    let id = subscription.id;
    let errors = subscription.state.consecutive_errors + 1;
    let base_interval = subscription.state.poll_interval.max(1) as f64;
    let backoff_base = (base_interval * 2f64.powi(errors.min(30) as i32)).min(MAX_ERROR_BACKOFF_SECS);
    let jitter = rand::thread_rng().gen_range(0.0..(backoff_base * 0.1).max(0.0001));
    let backoff = (backoff_base + jitter) as i64;
    let next_poll_at = Utc::now() + chrono::Duration::seconds(backoff);

    store::update_state(
        pool,
        id,
        &[
            ("consecutive_errors", StateValue::Int(errors)),
            ("last_error", StateValue::Text(Some(message.to_string()))),
            ("next_poll_at", StateValue::Timestamp(Some(next_poll_at))),
        ],
    )
    .await
}

async fn schedule_success(
    pool: &SqlitePool,
    id: i64,
    etag: Option<String>,
    last_modified: Option<String>,
    interval: i64,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.25);
    let jittered_secs = interval + (interval as f64 * jitter_fraction) as i64;
    let next_poll_at = now + chrono::Duration::seconds(jittered_secs);

    store::update_state(
        pool,
        id,
        &[
            ("etag", StateValue::Text(etag)),
            ("last_modified", StateValue::Text(last_modified)),
            ("last_poll_at", StateValue::Timestamp(Some(now))),
            ("next_poll_at", StateValue::Timestamp(Some(next_poll_at))),
            ("poll_interval", StateValue::Int(interval)),
            ("consecutive_errors", StateValue::Int(0)),
            ("last_error", StateValue::Text(None)),
        ],
    )
    .await
}

/// Half the mean gap between consecutive publication timestamps (sorted
/// newest first), clamped to `[min_interval, max_interval]`. `None` when
/// fewer than two timestamps are available.
fn calculate_adaptive_interval(
    mut timestamps: Vec<DateTime<Utc>>,
    min_interval: i64,
    max_interval: i64,
) -> Option<i64> {
    if timestamps.len() < 2 {
        return None;
    }
    timestamps.sort_by(|a, b| b.cmp(a));
    let gaps: Vec<i64> = timestamps
        .windows(2)
        .map(|w| (w[0] - w[1]).num_seconds())
        .collect();
    let mean_gap = gaps.iter().sum::<i64>() as f64 / gaps.len() as f64;
    let candidate = (mean_gap / 2.0) as i64;
    Some(candidate.clamp(min_interval, max_interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn adaptive_interval_high_cadence_lands_near_one_hour() {
        let timestamps = vec![ts(12), ts(10), ts(8), ts(6)];
        let interval = calculate_adaptive_interval(timestamps, 300, 43_200).unwrap();
        assert!((3000..=4200).contains(&interval), "got {interval}");
    }

    #[test]
    fn adaptive_interval_clamps_to_max() {
        let timestamps = vec![ts(0), Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap()];
        let interval = calculate_adaptive_interval(timestamps, 300, 43_200).unwrap();
        assert_eq!(interval, 43_200);
    }

    #[test]
    fn adaptive_interval_absent_below_two_timestamps() {
        assert_eq!(calculate_adaptive_interval(vec![ts(0)], 300, 43_200), None);
    }
}
