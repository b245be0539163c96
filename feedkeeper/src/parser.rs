//! Pure feed parsing: bytes in, `(FeedMetadata, Vec<ParsedItem>)` out. No I/O.
//!
//! Restructured as a pure function around `feed_rs`'s entry model, with
//! HTML stripping done via `scraper`'s html5ever-backed tree (walking
//! text nodes rather than selecting link tags).

use ego_tree::NodeRef;
use feed_rs::model::{Entry, Feed, MediaObject};
use scraper::{Html, Node, Selector};

use crate::error::CoreError;
use crate::model::{FeedMetadata, ParsedItem};

const SUMMARY_MAX_CHARS: usize = 300;
const TITLE_SYNTHESIS_MAX_CHARS: usize = 80;
const BOILERPLATE_MIN_CHARS: usize = 20;

pub fn parse_feed(bytes: &[u8]) -> anyhow::Result<(FeedMetadata, Vec<ParsedItem>)> {
    let feed = feed_rs::parser::parse(bytes).map_err(|_| CoreError::Unparseable)?;

    let metadata = extract_metadata(&feed);

    // First pass: html-stripped, un-truncated summaries for every entry, so
    // the boilerplate trim below sees the full shared text.
    let mut cleaned_summaries: Vec<String> = Vec::with_capacity(feed.entries.len());
    let mut raw_summaries: Vec<String> = Vec::with_capacity(feed.entries.len());
    for entry in &feed.entries {
        let raw = raw_summary_source(entry);
        cleaned_summaries.push(strip_html(&raw));
        raw_summaries.push(raw);
    }

    trim_boilerplate(&mut cleaned_summaries);

    let items = feed
        .entries
        .iter()
        .zip(cleaned_summaries.into_iter())
        .zip(raw_summaries.iter())
        .map(|((entry, cleaned_summary), raw_summary)| {
            extract_item(entry, &cleaned_summary, raw_summary)
        })
        .collect();

    Ok((metadata, items))
}

fn extract_metadata(feed: &Feed) -> FeedMetadata {
    let title = feed
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .unwrap_or_default();
    let link = feed.links.first().map(|l| l.href.clone());
    let description = feed.description.as_ref().map(|t| t.content.clone());
    let ttl = feed.ttl.map(|t| t as i64);
    let image_url = feed
        .logo
        .as_ref()
        .or(feed.icon.as_ref())
        .map(|img| img.uri.clone());

    FeedMetadata {
        title,
        link,
        description,
        ttl,
        image_url,
    }
}

fn raw_summary_source(entry: &Entry) -> String {
    entry
        .summary
        .as_ref()
        .map(|t| t.content.clone())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            entry
                .content
                .as_ref()
                .and_then(|c| c.body.clone())
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_default()
}

fn extract_item(entry: &Entry, cleaned_summary: &str, raw_summary: &str) -> ParsedItem {
    let link = entry.links.first().map(|l| l.href.clone());
    let guid = if !entry.id.is_empty() {
        entry.id.clone()
    } else {
        link.clone().unwrap_or_default()
    };

    let title = entry
        .title
        .as_ref()
        .map(|t| t.content.clone())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| truncate_at_word_boundary(cleaned_summary, TITLE_SYNTHESIS_MAX_CHARS));

    let summary = truncate_at_word_boundary(cleaned_summary, SUMMARY_MAX_CHARS);

    let author = entry.authors.first().map(|p| p.name.clone());
    let published = entry
        .published
        .or(entry.updated)
        .map(|ts| ts.to_rfc3339());

    let image_url = extract_image(entry, raw_summary);

    ParsedItem {
        title,
        link,
        guid,
        summary,
        author,
        published,
        image_url,
    }
}

/// Prefers media-content marked as image (or with an image extension), then
/// media-thumbnail, then an image-typed enclosure link, then the first
/// `<img>` tag embedded in the raw (unstripped) summary/content.
fn extract_image(entry: &Entry, raw_summary: &str) -> Option<String> {
    if let Some(url) = media_content_image(&entry.media) {
        return Some(url);
    }
    if let Some(url) = media_thumbnail_image(&entry.media) {
        return Some(url);
    }
    if let Some(url) = enclosure_image(entry) {
        return Some(url);
    }
    first_img_src(raw_summary)
}

const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".webp"];

fn media_content_image(media: &[MediaObject]) -> Option<String> {
    for obj in media {
        for content in &obj.content {
            let url = content.url.as_ref().map(|u| u.to_string());
            let Some(url) = url else { continue };
            let is_image_type = content
                .content_type
                .as_ref()
                .map(|m| m.to_string().starts_with("image/"))
                .unwrap_or(false);
            let bare = url.split('?').next().unwrap_or(&url).to_lowercase();
            let has_image_ext = IMAGE_EXTENSIONS.iter().any(|ext| bare.ends_with(ext));
            if is_image_type || has_image_ext {
                return Some(url);
            }
        }
    }
    None
}

fn media_thumbnail_image(media: &[MediaObject]) -> Option<String> {
    for obj in media {
        if let Some(thumb) = obj.thumbnails.first() {
            return Some(thumb.image.uri.clone());
        }
    }
    None
}

fn enclosure_image(entry: &Entry) -> Option<String> {
    entry
        .links
        .iter()
        .find(|l| {
            l.rel.as_deref() == Some("enclosure")
                && l.media_type
                    .as_deref()
                    .map(|t| t.starts_with("image/"))
                    .unwrap_or(false)
        })
        .map(|l| l.href.clone())
}

fn first_img_src(raw_html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(raw_html);
    let selector = Selector::parse("img").ok()?;
    fragment
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr("src"))
        .map(|s| s.to_string())
}

/// Strips HTML tags from `raw`, neutralizing `<a>` elements whose visible
/// text is just their bare href (they contribute no information), decoding
/// entities along the way (free, since html5ever decodes during parsing),
/// and collapsing the resulting runs of whitespace.
fn strip_html(raw: &str) -> String {
    if raw.trim().is_empty() {
        return String::new();
    }
    let fragment = Html::parse_fragment(raw);
    let mut out = String::new();
    visit(fragment.tree.root(), &mut out);
    collapse_whitespace(&out)
}

fn visit(node: NodeRef<Node>, out: &mut String) {
    match node.value() {
        Node::Text(text) => out.push_str(text),
        Node::Element(elem) => {
            if elem.name() == "a" {
                let mut anchor_text = String::new();
                for child in node.children() {
                    visit(child, &mut anchor_text);
                }
                let href = elem.attr("href").unwrap_or("").trim();
                if anchor_text.trim() == href && !href.is_empty() {
                    // Bare-URL anchor: contributes nothing to the summary.
                } else {
                    out.push_str(&anchor_text);
                }
            } else {
                for child in node.children() {
                    visit(child, out);
                }
            }
        }
        _ => {
            for child in node.children() {
                visit(child, out);
            }
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

fn truncate_at_word_boundary(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    let cut = match truncated.rfind(' ') {
        Some(idx) if idx > 0 => truncated[..idx].to_string(),
        _ => truncated,
    };
    format!("{cut}…")
}

/// Removes a boilerplate prefix/suffix shared by most items, per spec: the
/// longest prefix shared by at least `max(2, floor(0.8*n))` items, snapped
/// back to the last space inside it, dropped when it reaches 20+ chars.
/// Symmetric for suffixes. A no-op below two items.
fn trim_boilerplate(items: &mut [String]) {
    let n = items.len();
    if n < 2 {
        return;
    }
    let threshold = std::cmp::max(2, (0.8 * n as f64).floor() as usize);

    if let Some(prefix) = find_shared_prefix(items, threshold) {
        if prefix.chars().count() >= BOILERPLATE_MIN_CHARS {
            let snapped = snap_prefix(&prefix);
            if !snapped.is_empty() {
                for item in items.iter_mut() {
                    if let Some(rest) = item.strip_prefix(snapped.as_str()) {
                        *item = rest.to_string();
                    }
                }
            }
        }
    }

    if let Some(suffix) = find_shared_suffix(items, threshold) {
        if suffix.chars().count() >= BOILERPLATE_MIN_CHARS {
            let snapped = snap_suffix(&suffix);
            if !snapped.is_empty() {
                for item in items.iter_mut() {
                    if let Some(rest) = item.strip_suffix(snapped.as_str()) {
                        *item = rest.to_string();
                    }
                }
            }
        }
    }
}

fn find_shared_prefix(items: &[String], threshold: usize) -> Option<String> {
    let mut best: Option<String> = None;
    for pivot in items {
        let pivot_chars: Vec<char> = pivot.chars().collect();
        for l in (1..=pivot_chars.len()).rev() {
            let candidate: String = pivot_chars[..l].iter().collect();
            let count = items.iter().filter(|it| it.starts_with(&candidate)).count();
            if count >= threshold {
                if best.as_ref().map_or(true, |b| l > b.chars().count()) {
                    best = Some(candidate);
                }
                break;
            }
        }
    }
    best
}

fn find_shared_suffix(items: &[String], threshold: usize) -> Option<String> {
    let mut best: Option<String> = None;
    for pivot in items {
        let pivot_chars: Vec<char> = pivot.chars().collect();
        let plen = pivot_chars.len();
        for l in (1..=plen).rev() {
            let candidate: String = pivot_chars[plen - l..].iter().collect();
            let count = items.iter().filter(|it| it.ends_with(&candidate)).count();
            if count >= threshold {
                if best.as_ref().map_or(true, |b| l > b.chars().count()) {
                    best = Some(candidate);
                }
                break;
            }
        }
    }
    best
}

fn snap_prefix(prefix: &str) -> String {
    match prefix.rfind(' ') {
        Some(idx) => prefix[..=idx].to_string(),
        None => prefix.to_string(),
    }
}

fn snap_suffix(suffix: &str) -> String {
    match suffix.find(' ') {
        Some(idx) => suffix[idx..].to_string(),
        None => suffix.to_string(),
    }
}
