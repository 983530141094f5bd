// src/feed/bilibili.rs
//! Canonical `FeedSource` against the Bilibili space-feed API.
//!
//! The wire format is the polymer web-dynamic JSON; parsing walks it
//! untyped because only a handful of fields matter and the schema
//! shifts under our feet.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::Value;

use super::{ActivityItem, FeedSource, FetchError, ItemKind, VideoRef};
use crate::auth::CredentialStore;

const SPACE_FEED_URL: &str = "https://api.bilibili.com/x/polymer/web-dynamic/v1/feed/space";
const DYNAMIC_URL: &str = "https://t.bilibili.com";
const VIDEO_URL: &str = "https://www.bilibili.com/video";

/// Feed items older than this position in the response are ignored.
const RECENT_LIMIT: usize = 20;

pub struct BilibiliFeedSource {
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
    user_agent: String,
}

impl BilibiliFeedSource {
    pub fn new(credentials: Arc<CredentialStore>, user_agent: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("building feed http client")?;
        Ok(Self {
            http,
            credentials,
            user_agent,
        })
    }

    async fn fetch_raw(&self, creator_id: &str) -> Result<Value, FetchError> {
        let cred = self.credentials.current();

        let mut req = self
            .http
            .get(SPACE_FEED_URL)
            .query(&[
                ("offset", ""),
                ("host_mid", creator_id),
                ("timezone_offset", "-480"),
                ("platform", "web"),
                ("features", "itemOpusStyle,listOnlyfans,opusBigCover"),
            ])
            .header("User-Agent", &self.user_agent)
            .header(
                "Referer",
                format!("https://space.bilibili.com/{creator_id}/dynamic"),
            )
            .header("Origin", "https://space.bilibili.com")
            .header("Accept", "application/json, text/plain, */*");
        if let Some(cookie) = cred.cookie_header() {
            req = req.header("Cookie", cookie);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::Transport(anyhow!("space feed request: {e}")))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::Transport(anyhow!(
                "space feed HTTP status {status}"
            )));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| FetchError::Transport(anyhow!("space feed body: {e}")))?;

        match body.get("code").and_then(Value::as_i64).unwrap_or(-1) {
            0 => Ok(body),
            // Not logged in / credential rejected.
            -101 | -111 => Err(FetchError::AuthInvalid),
            // Risk-control throttling.
            -352 | -412 => Err(FetchError::RateLimited),
            -404 => Err(FetchError::NotFound(creator_id.to_string())),
            code => {
                let msg = body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                Err(FetchError::Transport(anyhow!(
                    "space feed API error code={code} message={msg}"
                )))
            }
        }
    }
}

#[async_trait]
impl FeedSource for BilibiliFeedSource {
    async fn fetch_recent(&self, creator_id: &str) -> Result<Vec<ActivityItem>, FetchError> {
        let body = self.fetch_raw(creator_id).await?;
        let items = body
            .pointer("/data/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let parsed: Vec<ActivityItem> = items
            .iter()
            .take(RECENT_LIMIT)
            .filter_map(parse_item)
            .collect();
        Ok(parsed)
    }

    fn name(&self) -> &'static str {
        "bilibili"
    }
}

/// Parse one feed entry. Entries missing an ID are dropped here rather
/// than surfaced as malformed items: without an ID they cannot be
/// deduplicated at all.
fn parse_item(item: &Value) -> Option<ActivityItem> {
    let id = item
        .get("id_str")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| item.get("id").and_then(Value::as_i64).map(|v| v.to_string()))?;

    let published_at = publish_timestamp(item);
    let pinned = is_pinned(item);
    let video = extract_video(item);
    let kind = item_kind(item, video.is_some());
    let body = parse_text(item);
    let title = video
        .as_ref()
        .map(|v| v.title.clone())
        .unwrap_or_else(|| first_line(&body));

    Some(ActivityItem {
        url: format!("{DYNAMIC_URL}/{id}"),
        id,
        kind,
        published_at,
        title,
        body,
        video,
        pinned,
    })
}

/// Title surrogate for text posts: the first non-empty line, trimmed of
/// markdown emphasis.
fn first_line(body: &str) -> String {
    body.lines()
        .map(|l| l.trim().trim_matches('*').trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string()
}

fn publish_timestamp(item: &Value) -> i64 {
    item.pointer("/modules/module_author/pub_ts")
        .and_then(Value::as_i64)
        .or_else(|| item.get("timestamp").and_then(Value::as_i64))
        .unwrap_or(0)
}

fn is_pinned(item: &Value) -> bool {
    item.pointer("/modules/module_tag/text")
        .and_then(Value::as_str)
        .map(|t| t == "置顶")
        .unwrap_or(false)
}

fn item_kind(item: &Value, has_video: bool) -> ItemKind {
    if has_video {
        return ItemKind::Video;
    }
    match item.get("type").and_then(Value::as_str).unwrap_or("") {
        "DYNAMIC_TYPE_AV" => ItemKind::Video,
        "DYNAMIC_TYPE_FORWARD" => ItemKind::Repost,
        "DYNAMIC_TYPE_WORD" | "DYNAMIC_TYPE_DRAW" | "DYNAMIC_TYPE_OPUS"
        | "DYNAMIC_TYPE_ARTICLE" => ItemKind::Text,
        _ => ItemKind::Other,
    }
}

fn extract_video(item: &Value) -> Option<VideoRef> {
    let major = item.pointer("/modules/module_dynamic/major")?;
    let major_type = major.get("type").and_then(Value::as_str).unwrap_or("");
    if major_type != "MAJOR_TYPE_ARCHIVE" && major_type != "archive" {
        return None;
    }
    let archive = major.get("archive")?;
    let bvid = archive.get("bvid").and_then(Value::as_str)?.to_string();
    let title = archive
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(VideoRef {
        url: format!("{VIDEO_URL}/{bvid}"),
        video_id: bvid,
        title,
    })
}

/// Extract renderable markdown-ish text from a feed entry: opus title and
/// summary, plain desc text, and image URLs as markdown image links.
fn parse_text(item: &Value) -> String {
    let Some(dynamic) = item.pointer("/modules/module_dynamic") else {
        return String::new();
    };

    let mut text_parts: Vec<String> = Vec::new();
    let mut image_urls: Vec<String> = Vec::new();

    if let Some(major) = dynamic.get("major") {
        match major.get("type").and_then(Value::as_str).unwrap_or("") {
            "MAJOR_TYPE_OPUS" => {
                if let Some(opus) = major.get("opus") {
                    if let Some(title) = opus.get("title").and_then(Value::as_str) {
                        if !title.is_empty() {
                            text_parts.push(format!("**{title}**\n"));
                        }
                    }
                    if let Some(text) = opus.pointer("/summary/text").and_then(Value::as_str) {
                        text_parts.push(text.trim().to_string());
                    }
                    if let Some(pics) = opus.get("pics").and_then(Value::as_array) {
                        for pic in pics {
                            if let Some(url) = pic.get("url").and_then(Value::as_str) {
                                image_urls.push(url.to_string());
                            }
                        }
                    }
                }
            }
            "MAJOR_TYPE_DRAW" => {
                if let Some(pics) = major.pointer("/draw/items").and_then(Value::as_array) {
                    for pic in pics {
                        if let Some(src) = pic.get("src").and_then(Value::as_str) {
                            image_urls.push(src.to_string());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    // Fall back to the desc block when the major carried no text.
    if text_parts.is_empty() {
        if let Some(desc) = dynamic.get("desc") {
            if let Some(nodes) = desc.get("rich_text_nodes").and_then(Value::as_array) {
                for node in nodes {
                    if node.get("type").and_then(Value::as_str) == Some("RICH_TEXT_NODE_TYPE_TEXT")
                    {
                        if let Some(t) = node.get("text").and_then(Value::as_str) {
                            text_parts.push(t.to_string());
                        }
                    }
                }
            }
            if text_parts.is_empty() {
                if let Some(t) = desc.get("text").and_then(Value::as_str) {
                    text_parts.push(t.trim().to_string());
                }
            }
        }
    }

    let mut out: Vec<String> = Vec::new();
    let joined = text_parts.concat().trim().to_string();
    if !joined.is_empty() {
        out.push(joined);
    }
    if !image_urls.is_empty() {
        if !out.is_empty() {
            out.push(String::new());
        }
        for (i, url) in image_urls.iter().enumerate() {
            out.push(format!("![image {}]({url})", i + 1));
        }
    }
    out.join("\n")
}
