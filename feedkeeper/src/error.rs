//! Typed error kinds the core needs callers to be able to distinguish.
//! Everything that only needs to propagate/log uses `anyhow::Result`
//! instead (see `store.rs`, `worker.rs`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("document yielded no items and the parser flagged an error")]
    Unparseable,

    #[error("no feed document found at or linked from the given page")]
    FeedNotFound,

    #[error("feed is permanently gone (HTTP 410)")]
    PermanentGone,

    #[error("rate limited, retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<i64> },

    #[error("upstream server error (HTTP {0})")]
    ServerError(u16),

    #[error("unexpected HTTP status {0}")]
    HttpError(u16),

    #[error("response body exceeded the {0} byte cap")]
    PayloadTooLarge(u64),

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("a subscription for this feed URL already exists on this server")]
    DuplicateSubscription,

    #[error("unknown state field: {0}")]
    UnknownStateField(String),
}
