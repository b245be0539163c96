//! HTTP fetcher: conditional-GET state machine, streamed body-size cap, and
//! the per-host concurrency limiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::error::CoreError;

pub const MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REQUESTS_PER_HOST: usize = 2;
const UNKNOWN_HOST_BUCKET: &str = "__unknown__";

#[derive(Debug)]
pub enum FetchOutcome {
    NotModified,
    Fresh {
        body: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Per-host semaphores, created lazily and held for the process lifetime.
/// No LRU bound: an unbounded host set is out of scope for this system's
/// expected scale.
#[derive(Default)]
pub struct HostSemaphores {
    inner: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostSemaphores {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, host: &str) -> OwnedSemaphorePermit {
        let sem = {
            let mut map = self.inner.lock().expect("host semaphore map poisoned");
            map.entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(MAX_REQUESTS_PER_HOST)))
                .clone()
        };
        sem.acquire_owned()
            .await
            .expect("semaphore is never closed")
    }
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| UNKNOWN_HOST_BUCKET.to_string())
}

/// Conditional GET against `feed_url`. Acquires the per-host semaphore for
/// the duration of the request. Returns `Ok` only for `304`/`200`; every
/// other status or transport failure surfaces as the matching `CoreError`.
pub async fn fetch(
    client: &Client,
    semaphores: &HostSemaphores,
    feed_url: &str,
    etag: Option<&str>,
    last_modified: Option<&str>,
    user_agent: &str,
) -> Result<FetchOutcome, CoreError> {
    let host = host_of(feed_url);
    let _permit = semaphores.acquire(&host).await;

    let mut req = client
        .get(feed_url)
        .timeout(FETCH_TIMEOUT)
        .header(reqwest::header::USER_AGENT, user_agent)
        .header(reqwest::header::ACCEPT_ENCODING, "gzip");
    if let Some(etag) = etag {
        req = req.header(reqwest::header::IF_NONE_MATCH, etag);
    }
    if let Some(last_modified) = last_modified {
        req = req.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
    }

    let resp = req.send().await?;
    let status = resp.status();

    match status.as_u16() {
        304 => Ok(FetchOutcome::NotModified),
        200 => {
            let etag = header_str(&resp, reqwest::header::ETAG);
            let last_modified = header_str(&resp, reqwest::header::LAST_MODIFIED);
            let body = read_capped_body(resp).await?;
            Ok(FetchOutcome::Fresh {
                body,
                etag,
                last_modified,
            })
        }
        410 => Err(CoreError::PermanentGone),
        403 | 429 => {
            let retry_after_secs = header_str(&resp, reqwest::header::RETRY_AFTER)
                .and_then(|s| s.parse::<i64>().ok());
            Err(CoreError::RateLimited { retry_after_secs })
        }
        code if (500..600).contains(&code) => Err(CoreError::ServerError(code)),
        code => Err(CoreError::HttpError(code)),
    }
}

fn header_str(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Reads the response body via `bytes_stream`, failing as soon as the
/// accumulated size exceeds `MAX_BODY_BYTES` rather than buffering the
/// whole thing first.
async fn read_capped_body(resp: reqwest::Response) -> Result<Vec<u8>, CoreError> {
    let mut stream = resp.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 > MAX_BODY_BYTES {
            return Err(CoreError::PayloadTooLarge(MAX_BODY_BYTES));
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client() -> Client {
        Client::new()
    }

    #[tokio::test]
    async fn not_modified_on_304() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(304);
        });
        let semaphores = HostSemaphores::new();
        let outcome = fetch(
            &client(),
            &semaphores,
            &format!("{}/feed.xml", server.base_url()),
            Some("\"abc\""),
            None,
            "feedkeeper/test",
        )
        .await
        .unwrap();
        assert!(matches!(outcome, FetchOutcome::NotModified));
    }

    #[tokio::test]
    async fn fresh_on_200_captures_validators() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(200)
                .header("etag", "\"xyz\"")
                .header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                .body("feed body");
        });
        let semaphores = HostSemaphores::new();
        let outcome = fetch(
            &client(),
            &semaphores,
            &format!("{}/feed.xml", server.base_url()),
            None,
            None,
            "feedkeeper/test",
        )
        .await
        .unwrap();
        match outcome {
            FetchOutcome::Fresh { body, etag, last_modified } => {
                assert_eq!(body, b"feed body");
                assert_eq!(etag.as_deref(), Some("\"xyz\""));
                assert_eq!(last_modified.as_deref(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
            }
            other => panic!("expected Fresh, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn gone_on_410() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(410);
        });
        let semaphores = HostSemaphores::new();
        let err = fetch(
            &client(),
            &semaphores,
            &format!("{}/feed.xml", server.base_url()),
            None,
            None,
            "feedkeeper/test",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::PermanentGone));
    }

    #[tokio::test]
    async fn rate_limited_parses_retry_after() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(429).header("retry-after", "120");
        });
        let semaphores = HostSemaphores::new();
        let err = fetch(
            &client(),
            &semaphores,
            &format!("{}/feed.xml", server.base_url()),
            None,
            None,
            "feedkeeper/test",
        )
        .await
        .unwrap_err();
        match err {
            CoreError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, Some(120)),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_with_non_numeric_retry_after_is_absent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(403)
                .header("retry-after", "Wed, 21 Oct 2015 07:28:00 GMT");
        });
        let semaphores = HostSemaphores::new();
        let err = fetch(
            &client(),
            &semaphores,
            &format!("{}/feed.xml", server.base_url()),
            None,
            None,
            "feedkeeper/test",
        )
        .await
        .unwrap_err();
        match err {
            CoreError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, None),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_on_5xx() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(503);
        });
        let semaphores = HostSemaphores::new();
        let err = fetch(
            &client(),
            &semaphores,
            &format!("{}/feed.xml", server.base_url()),
            None,
            None,
            "feedkeeper/test",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::ServerError(503)));
    }

    #[tokio::test]
    async fn body_over_cap_fails_with_payload_too_large() {
        let server = MockServer::start();
        let oversized = vec![b'x'; (MAX_BODY_BYTES + 1) as usize];
        server.mock(|when, then| {
            when.method(GET).path("/feed.xml");
            then.status(200).body(oversized.clone());
        });
        let semaphores = HostSemaphores::new();
        let err = fetch(
            &client(),
            &semaphores,
            &format!("{}/feed.xml", server.base_url()),
            None,
            None,
            "feedkeeper/test",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::PayloadTooLarge(_)));
    }
}
