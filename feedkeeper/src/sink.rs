//! The publisher sink: the external collaborator that turns a parsed item
//! into a chat message. The core only guarantees the raw item reaches it —
//! mention neutralization and markdown escaping are the rendering
//! collaborator's job, not the core's (see spec §1/§8-S8).

use async_trait::async_trait;
use tracing::info;

/// Consumed by the worker. A real chat-platform adapter implements this;
/// `LoggingSink` below stands in for one in the binary's default wiring and
/// in tests.
#[async_trait]
pub trait PublisherSink: Send + Sync {
    /// Fire-and-forget post of a rendered message to a channel. May fail;
    /// the worker journals the item regardless of the outcome.
    async fn post(&self, channel_id: &str, rendered_message: &str) -> Option<String>;

    /// Best-effort one-shot notice, used before auto-removing a
    /// `PermanentGone` subscription.
    async fn notify_removed(&self, channel_id: &str, text: &str);

    /// Cheap existence check. When `false`, the worker skips sending but
    /// still journals the item.
    async fn resolve_channel(&self, channel_id: &str) -> bool;
}

/// Reference sink: logs the raw rendered message via `tracing` and returns
/// a synthetic message id. Receives the *unaltered* title/summary strings —
/// it does not neutralize mentions itself, demonstrating that the core
/// passes raw text through untouched.
pub struct LoggingSink;

#[async_trait]
impl PublisherSink for LoggingSink {
    async fn post(&self, channel_id: &str, rendered_message: &str) -> Option<String> {
        info!(channel_id, message = rendered_message, "posted item");
        Some(format!("synthetic-{}", uuid_like()))
    }

    async fn notify_removed(&self, channel_id: &str, text: &str) {
        info!(channel_id, text, "notified channel of removal");
    }

    async fn resolve_channel(&self, channel_id: &str) -> bool {
        info!(channel_id, "resolved channel (logging sink always succeeds)");
        true
    }
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}")
}
