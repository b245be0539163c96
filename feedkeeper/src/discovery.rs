//! Feed autodiscovery: given a web page URL, locate its advertised feed
//! document. `<link>` tag extraction is done via `scraper` instead of
//! regex for this kind of HTML walk.

use std::time::Duration;

use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::CoreError;
use crate::parser;

const FEED_TYPES: &[&str] = &["rss+xml", "atom+xml", "feed+json"];
const WELL_KNOWN_PATHS: &[&str] = &[
    "/feed",
    "/feed.xml",
    "/rss.xml",
    "/atom.xml",
    "/rss",
    "/index.xml",
    "/feed.json",
    "/blog/feed",
];
/// Three ordered strategies, returning on the first that yields a valid
/// feed document: direct parse, HTML `<link rel="alternate">` autodiscovery,
/// then well-known-path probing. `timeout` bounds every request the
/// strategies make, including the well-known-path `HEAD` probes.
pub async fn discover(page_url: &str, client: &Client, timeout: Duration) -> anyhow::Result<String> {
    info!(url = page_url, "starting feed discovery");

    let (content_type, body) = match fetch_with_headers(client, page_url, timeout).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(url = page_url, error = %e, "failed to fetch url for discovery");
            return Err(CoreError::FeedNotFound.into());
        }
    };

    if is_valid_feed(&body) {
        info!(url = page_url, "url is a valid feed directly");
        return Ok(page_url.to_string());
    }

    if looks_like_html(&content_type, &body) {
        for link in find_feed_links(&body, page_url) {
            debug!(feed_url = %link, "found feed link in html");
            if let Ok(probe_body) = fetch_text(client, &link, timeout).await {
                if is_valid_feed(&probe_body) {
                    info!(url = page_url, feed_url = %link, "discovered feed via html link tag");
                    return Ok(link);
                }
            }
        }
    }

    if let Ok(base) = origin(page_url) {
        for path in WELL_KNOWN_PATHS {
            let probe_url = format!("{base}{path}");

            let head_ok = match client.head(&probe_url).timeout(timeout).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    let ct = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    content_type_looks_feedish(&ct)
                }
                _ => false,
            };
            if !head_ok {
                continue;
            }

            if let Ok(probe_body) = fetch_text(client, &probe_url, timeout).await {
                if is_valid_feed(&probe_body) {
                    info!(url = page_url, feed_url = %probe_url, "discovered feed via well-known path");
                    return Ok(probe_url);
                }
            }
        }
    }

    warn!(url = page_url, "no feed found");
    Err(CoreError::FeedNotFound.into())
}

async fn fetch_with_headers(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> anyhow::Result<(String, String)> {
    let resp = client.get(url).timeout(timeout).send().await?;
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = resp.text().await?;
    Ok((content_type, body))
}

async fn fetch_text(client: &Client, url: &str, timeout: Duration) -> anyhow::Result<String> {
    Ok(client.get(url).timeout(timeout).send().await?.text().await?)
}

fn is_valid_feed(body: &str) -> bool {
    match parser::parse_feed(body.as_bytes()) {
        Ok((metadata, items)) => !items.is_empty() || !metadata.title.is_empty(),
        Err(_) => false,
    }
}

fn looks_like_html(content_type: &str, body: &str) -> bool {
    if content_type.to_lowercase().contains("html") {
        return true;
    }
    let stripped = body.trim_start().to_lowercase();
    stripped.starts_with("<!doctype") || stripped.starts_with("<html")
}

fn content_type_looks_feedish(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ["xml", "rss", "atom", "json"].iter().any(|kw| ct.contains(kw))
}

fn find_feed_links(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let fragment = Html::parse_document(html);
    let Ok(selector) = Selector::parse("link") else {
        return Vec::new();
    };

    fragment
        .select(&selector)
        .filter_map(|el| {
            let rel = el.value().attr("rel").unwrap_or("").to_lowercase();
            let link_type = el.value().attr("type").unwrap_or("").to_lowercase();
            let href = el.value().attr("href")?;
            if rel != "alternate" || href.is_empty() {
                return None;
            }
            if FEED_TYPES.iter().any(|ft| link_type.contains(ft)) {
                base.join(href).ok().map(|u| u.to_string())
            } else {
                None
            }
        })
        .collect()
}

fn origin(url: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("url has no host: {url}"))?;
    match parsed.port() {
        Some(port) => Ok(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Ok(format!("{}://{}", parsed.scheme(), host)),
    }
}
