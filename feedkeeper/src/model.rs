//! Plain data types shared across the store, parser, worker, and command
//! facade. These are independent of how the store represents rows on disk.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered intent to deliver new items from one feed URL into one chat
/// channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub feed_url: String,
    pub display_name: String,
    pub channel_id: String,
    pub server_id: String,
    pub added_by: String,
    pub created_at: DateTime<Utc>,
    pub state: SubscriptionState,
}

/// The polling-state fields of a subscription, mutated by the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub next_poll_at: Option<DateTime<Utc>>,
    pub poll_interval: i64,
    pub consecutive_errors: i64,
    pub last_error: Option<String>,
}

/// Records that an item with a given stable identity has already been
/// delivered for a given subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostedItem {
    pub subscription_id: i64,
    pub item_guid: String,
    pub posted_at: DateTime<Utc>,
    pub message_id: Option<String>,
}

/// Transient value produced by the parser for one feed entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedItem {
    pub title: String,
    pub link: Option<String>,
    pub guid: String,
    pub summary: String,
    pub author: Option<String>,
    pub published: Option<String>,
    pub image_url: Option<String>,
}

/// Transient value produced by the parser describing the feed as a whole.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub title: String,
    pub link: Option<String>,
    pub description: Option<String>,
    pub ttl: Option<i64>,
    pub image_url: Option<String>,
}
