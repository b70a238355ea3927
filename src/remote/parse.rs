//! Parsing of remote payloads into engine types.
//!
//! Content is trusted; the only validation is that the fields the engine
//! keys on (story id, media URL) are present and non-empty.

use crate::error::RemoteError;
use crate::models::{MediaDescriptor, MediaKind, StoriesPage, StoryDescriptor};
use crate::utils::truncate_for_log;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

static TOKEN_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"input[name="authenticity_token"]"#).unwrap());

#[derive(Debug, Deserialize)]
struct ApiPage {
    stories: Option<Vec<Value>>,
    next_page_token: Option<String>,
}

/// Ids arrive as numbers or strings depending on the endpoint.
fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse one listing page body.
pub fn parse_stories_page(body: &str) -> Result<StoriesPage, RemoteError> {
    let page: ApiPage = serde_json::from_str(body).map_err(|e| {
        RemoteError::Decode(format!("{e}; body: {}", truncate_for_log(body, 200)))
    })?;

    let stories = page
        .stories
        .unwrap_or_default()
        .into_iter()
        .filter_map(parse_story)
        .collect();

    Ok(StoriesPage {
        stories,
        next_page_token: page.next_page_token.filter(|t| !t.trim().is_empty()),
    })
}

/// Read a story leniently: only the id and each media URL are required.
/// Optional fields of an unexpected type are treated as absent.
fn parse_story(raw: Value) -> Option<StoryDescriptor> {
    let Some(object) = raw.as_object() else {
        warn!("Skipping story that is not a JSON object");
        return None;
    };
    let Some(story_id) = id_string(object.get("id")) else {
        warn!("Skipping story without an id");
        return None;
    };

    let items = object
        .get("media")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    let mut media = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let Some(source_url) = text(item.get("resized_url")).or_else(|| text(item.get("cloudfront_feature_url")))
        else {
            warn!(%story_id, position, "Media item has no usable URL; skipping");
            continue;
        };
        media.push(MediaDescriptor {
            position,
            media_id: id_string(item.get("id")).unwrap_or_else(|| format!("media_{position}")),
            kind: MediaKind::from_api(item.get("type").and_then(Value::as_str)),
            source_url,
            expected_size: size(item.get("file_size")),
        });
    }

    debug!(%story_id, media = media.len(), "Parsed story");
    Some(StoryDescriptor {
        title: text(object.get("title")).unwrap_or_else(|| format!("story_{story_id}")),
        story_id,
        metadata: raw,
        media,
    })
}

fn text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Positive byte counts, given as a JSON integer or a numeric string.
fn size(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|size| *size > 0)
}

/// Extract the CSRF `authenticity_token` from a login page.
pub fn extract_authenticity_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    document
        .select(&TOKEN_SELECTOR)
        .filter_map(|input| input.value().attr("value"))
        .map(str::to_string)
        .find(|value| !value.is_empty())
}

/// Split a `Set-Cookie` header into its name and value, dropping attributes.
pub fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().trim_matches('"').to_string()))
}
