//! The command facade: translates administrator intent (subscribe,
//! unsubscribe, list, preview, status) into store mutations and one-shot
//! fetches. A plain Rust API — wiring a chat platform's slash commands to
//! it is left to an external adapter.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use sqlx::SqlitePool;
use tracing::info;

use crate::discovery;
use crate::error::CoreError;
use crate::fetch::MAX_BODY_BYTES;
use crate::model::{FeedMetadata, ParsedItem, Subscription};
use crate::parser;
use crate::sink::PublisherSink;
use crate::store;

/// Command-path fetches (after discovery has already located the feed) use
/// their own timeout, distinct from the worker's 30s steady-state fetch.
const COMMAND_FETCH_TIMEOUT: Duration = Duration::from_secs(15);
/// Timeout passed to `discovery::discover` for command-path discovery runs.
const DISCOVERY_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum SubscribeOutcome {
    Created(Subscription),
    Moved(Subscription),
    AlreadyHere(Subscription),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub default_poll_interval: i64,
    pub initial_items_count: usize,
    pub user_agent: String,
}

/// A preview result: feed metadata plus its most recent items, without
/// persisting anything.
#[derive(Debug)]
pub struct Preview {
    pub metadata: FeedMetadata,
    pub items: Vec<ParsedItem>,
}

/// Per-subscription health summary for `status`.
#[derive(Debug)]
pub struct SubscriptionStatus {
    pub subscription: Subscription,
    pub healthy: bool,
}

pub struct CommandFacade {
    pool: SqlitePool,
    client: Client,
    config: CommandConfig,
}

impl CommandFacade {
    pub fn new(pool: SqlitePool, client: Client, config: CommandConfig) -> Self {
        Self {
            pool,
            client,
            config,
        }
    }

    /// A numeric `url_or_id` is interpreted as an existing subscription id
    /// scoped to `server_id` (a move operation); otherwise it is treated as
    /// a page or feed URL and discovery is run.
    pub async fn subscribe(
        &self,
        sink: &dyn PublisherSink,
        url_or_id: &str,
        channel_id: &str,
        server_id: &str,
        added_by: &str,
    ) -> anyhow::Result<SubscribeOutcome> {
        if let Ok(id) = url_or_id.parse::<i64>() {
            return self.move_subscription(id, channel_id, server_id).await;
        }
        self.create_subscription(sink, url_or_id, channel_id, server_id, added_by)
            .await
    }

    async fn move_subscription(
        &self,
        id: i64,
        channel_id: &str,
        server_id: &str,
    ) -> anyhow::Result<SubscribeOutcome> {
        let Some(existing) = store::get_subscription(&self.pool, id).await? else {
            return Ok(SubscribeOutcome::NotFound);
        };
        if existing.server_id != server_id {
            return Ok(SubscribeOutcome::NotFound);
        }
        if existing.channel_id == channel_id {
            return Ok(SubscribeOutcome::AlreadyHere(existing));
        }

        store::update_channel(&self.pool, id, channel_id).await?;
        let moved = store::get_subscription(&self.pool, id)
            .await?
            .expect("subscription just updated must still exist");
        Ok(SubscribeOutcome::Moved(moved))
    }

    async fn create_subscription(
        &self,
        sink: &dyn PublisherSink,
        page_or_feed_url: &str,
        channel_id: &str,
        server_id: &str,
        added_by: &str,
    ) -> anyhow::Result<SubscribeOutcome> {
        let feed_url = match discovery::discover(page_or_feed_url, &self.client, DISCOVERY_PROBE_TIMEOUT).await {
            Ok(url) => url,
            Err(_) => return Ok(SubscribeOutcome::NotFound),
        };

        if let Some(existing) = store::get_subscription_by_url(&self.pool, &feed_url, server_id).await? {
            if existing.channel_id == channel_id {
                return Ok(SubscribeOutcome::AlreadyHere(existing));
            }
            store::update_channel(&self.pool, existing.id, channel_id).await?;
            let moved = store::get_subscription(&self.pool, existing.id)
                .await?
                .expect("subscription just updated must still exist");
            return Ok(SubscribeOutcome::Moved(moved));
        }

        let body = fetch_body(&self.client, &feed_url, &self.config.user_agent).await?;
        let (metadata, items) = parser::parse_feed(&body)?;

        let id = store::add_subscription(
            &self.pool,
            &feed_url,
            &metadata.title,
            channel_id,
            server_id,
            added_by,
            self.config.default_poll_interval,
        )
        .await?;

        // Pre-journal every item before delivering any, so a failure
        // mid-bootstrap cannot cause the scheduler to republish old items.
        for item in &items {
            store::record_posted(&self.pool, id, &item.guid, None).await?;
        }

        let mut to_deliver: Vec<&ParsedItem> =
            items.iter().take(self.config.initial_items_count).collect();
        to_deliver.reverse();

        for item in &to_deliver {
            if sink.resolve_channel(channel_id).await {
                let rendered = render_item(&metadata.title, item);
                sink.post(channel_id, &rendered).await;
            }
        }

        info!(subscription_id = id, feed_url, delivered = to_deliver.len(), "subscription created");

        let created = store::get_subscription(&self.pool, id)
            .await?
            .expect("subscription just created must exist");
        Ok(SubscribeOutcome::Created(created))
    }

    /// Returns `true` if a matching, scoped subscription was removed.
    pub async fn unsubscribe(&self, id: i64, server_id: &str) -> anyhow::Result<bool> {
        match store::get_subscription(&self.pool, id).await? {
            Some(sub) if sub.server_id == server_id => {
                store::remove_subscription(&self.pool, id).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn list(&self, server_id: &str) -> anyhow::Result<Vec<Subscription>> {
        store::list_subscriptions(&self.pool, server_id).await
    }

    /// One-shot fetch and parse, without touching the store. `url_or_id`
    /// may name an existing subscription (scoped to `server_id`) or a page
    /// / feed URL to discover fresh.
    pub async fn preview(&self, url_or_id: &str, server_id: &str) -> anyhow::Result<Preview> {
        let feed_url = if let Ok(id) = url_or_id.parse::<i64>() {
            let sub = store::get_subscription(&self.pool, id)
                .await?
                .filter(|s| s.server_id == server_id)
                .ok_or(CoreError::FeedNotFound)?;
            sub.feed_url
        } else {
            discovery::discover(url_or_id, &self.client, DISCOVERY_PROBE_TIMEOUT).await?
        };

        let body = fetch_body(&self.client, &feed_url, &self.config.user_agent).await?;
        let (metadata, items) = parser::parse_feed(&body)?;
        Ok(Preview { metadata, items })
    }

    /// Subscriptions with `consecutive_errors > 0` are reported unhealthy.
    pub async fn status(&self, server_id: &str) -> anyhow::Result<Vec<SubscriptionStatus>> {
        let subs = store::list_subscriptions(&self.pool, server_id).await?;
        Ok(subs
            .into_iter()
            .map(|s| {
                let healthy = s.state.consecutive_errors == 0;
                SubscriptionStatus { subscription: s, healthy }
            })
            .collect())
    }
}

fn render_item(display_name: &str, item: &ParsedItem) -> String {
    match &item.link {
        Some(link) => format!("[{display_name}] {}\n{link}", item.title),
        None => format!("[{display_name}] {}", item.title),
    }
}

async fn fetch_body(client: &Client, feed_url: &str, user_agent: &str) -> anyhow::Result<Vec<u8>> {
    let resp = client
        .get(feed_url)
        .timeout(COMMAND_FETCH_TIMEOUT)
        .header(reqwest::header::USER_AGENT, user_agent)
        .header(reqwest::header::ACCEPT_ENCODING, "gzip")
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(CoreError::HttpError(resp.status().as_u16()).into());
    }

    let mut stream = resp.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 > MAX_BODY_BYTES {
            return Err(CoreError::PayloadTooLarge(MAX_BODY_BYTES).into());
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LoggingSink;
    use httpmock::prelude::*;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        store::initialise(&pool, 900).await.unwrap();
        pool
    }

    fn feed_xml() -> &'static str {
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Feed</title>
            <item><title>One</title><link>https://example.com/1</link><guid>1</guid></item>
            <item><title>Two</title><link>https://example.com/2</link><guid>2</guid></item>
            </channel></rss>"#
    }

    #[tokio::test]
    async fn subscribe_creates_and_journals_before_delivering() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(200)
                .header("content-type", "application/rss+xml")
                .body(feed_xml());
        });

        let pool = memory_pool().await;
        let facade = CommandFacade::new(
            pool.clone(),
            Client::new(),
            CommandConfig {
                default_poll_interval: 900,
                initial_items_count: 1,
                user_agent: "feedkeeper/test".into(),
            },
        );
        let sink = LoggingSink;
        let url = format!("{}/feed.xml", server.base_url());
        let outcome = facade
            .subscribe(&sink, &url, "chan-1", "server-1", "user-1")
            .await
            .unwrap();

        let sub = match &outcome {
            SubscribeOutcome::Created(s) => s,
            other => panic!("expected Created, got {other:?}"),
        };
        assert_eq!(sub.feed_url, url);

        let posted = store::posted_subset(&pool, sub.id, &["1".into(), "2".into()])
            .await
            .unwrap();
        assert_eq!(posted.len(), 2, "both items must be pre-journaled even though only 1 was delivered");
    }

    #[tokio::test]
    async fn subscribe_twice_to_same_feed_same_channel_is_already_here() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(200)
                .header("content-type", "application/rss+xml")
                .body(feed_xml());
        });

        let pool = memory_pool().await;
        let facade = CommandFacade::new(
            pool,
            Client::new(),
            CommandConfig {
                default_poll_interval: 900,
                initial_items_count: 3,
                user_agent: "feedkeeper/test".into(),
            },
        );
        let sink = LoggingSink;
        let url = format!("{}/feed.xml", server.base_url());
        facade.subscribe(&sink, &url, "chan-1", "server-1", "user-1").await.unwrap();
        let second = facade.subscribe(&sink, &url, "chan-1", "server-1", "user-1").await.unwrap();
        assert!(matches!(second, SubscribeOutcome::AlreadyHere(_)));
    }

    #[tokio::test]
    async fn subscribe_unknown_url_is_not_found() {
        let pool = memory_pool().await;
        let facade = CommandFacade::new(
            pool,
            Client::new(),
            CommandConfig {
                default_poll_interval: 900,
                initial_items_count: 3,
                user_agent: "feedkeeper/test".into(),
            },
        );
        let sink = LoggingSink;
        let outcome = facade
            .subscribe(&sink, "http://127.0.0.1:1/nope", "chan-1", "server-1", "user-1")
            .await
            .unwrap();
        assert!(matches!(outcome, SubscribeOutcome::NotFound));
    }

    #[tokio::test]
    async fn unsubscribe_rejects_wrong_server_scope() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(200)
                .header("content-type", "application/rss+xml")
                .body(feed_xml());
        });
        let pool = memory_pool().await;
        let facade = CommandFacade::new(
            pool,
            Client::new(),
            CommandConfig {
                default_poll_interval: 900,
                initial_items_count: 3,
                user_agent: "feedkeeper/test".into(),
            },
        );
        let sink = LoggingSink;
        let url = format!("{}/feed.xml", server.base_url());
        let outcome = facade.subscribe(&sink, &url, "chan-1", "server-1", "user-1").await.unwrap();
        let id = match outcome {
            SubscribeOutcome::Created(s) => s.id,
            other => panic!("expected Created, got {other:?}"),
        };

        let removed_wrong_scope = facade.unsubscribe(id, "server-2").await.unwrap();
        assert!(!removed_wrong_scope);
        let removed = facade.unsubscribe(id, "server-1").await.unwrap();
        assert!(removed);
    }
}
