// src/summarize/transcript.rs
//! Transcript fetching for video items.
//!
//! Three hops against the upstream API: resolve the video's cid, list
//! available subtitle tracks, download and flatten the chosen track.
//! AI-generated Chinese tracks are preferred, matching what creators on
//! the platform usually publish.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::auth::CredentialStore;
use crate::feed::VideoRef;

const VIDEO_VIEW_URL: &str = "https://api.bilibili.com/x/web-interface/view";
const PLAYER_INFO_URL: &str = "https://api.bilibili.com/x/player/v2";

/// Opaque collaborator. `Ok(None)` means the video has no transcript,
/// which is an expected outcome; `Err` is a genuine failure.
#[async_trait]
pub trait TranscriptFetcher: Send + Sync {
    async fn fetch(&self, video: &VideoRef) -> Result<Option<String>>;
}

pub struct BilibiliTranscriptFetcher {
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
    user_agent: String,
}

impl BilibiliTranscriptFetcher {
    pub fn new(credentials: Arc<CredentialStore>, user_agent: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .context("building transcript http client")?;
        Ok(Self {
            http,
            credentials,
            user_agent,
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value> {
        let mut req = self
            .http
            .get(url)
            .query(query)
            .header("User-Agent", &self.user_agent);
        if let Some(cookie) = self.credentials.current().cookie_header() {
            req = req.header("Cookie", cookie);
        }
        let body: Value = req
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()
            .with_context(|| format!("status from {url}"))?
            .json()
            .await
            .with_context(|| format!("body from {url}"))?;
        if body.get("code").and_then(Value::as_i64) != Some(0) {
            bail!(
                "API error from {url}: code={} message={}",
                body.get("code").and_then(Value::as_i64).unwrap_or(-1),
                body.get("message").and_then(Value::as_str).unwrap_or("?")
            );
        }
        Ok(body)
    }

    async fn resolve_cid(&self, video_id: &str) -> Result<i64> {
        let body = self.get_json(VIDEO_VIEW_URL, &[("bvid", video_id)]).await?;
        body.pointer("/data/cid")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("video {video_id} has no cid"))
    }

    async fn list_tracks(&self, video_id: &str, cid: i64) -> Result<Vec<Value>> {
        let cid_s = cid.to_string();
        let body = self
            .get_json(PLAYER_INFO_URL, &[("bvid", video_id), ("cid", &cid_s)])
            .await?;
        Ok(body
            .pointer("/data/subtitle/subtitles")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_track(&self, mut url: String) -> Result<String> {
        if url.starts_with("//") {
            url = format!("https:{url}");
        }
        let body: Value = self
            .http
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .context("downloading subtitle track")?
            .error_for_status()
            .context("subtitle track status")?
            .json()
            .await
            .context("subtitle track body")?;

        let lines = body
            .get("body")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("subtitle track has no body array"))?;
        let texts: Vec<&str> = lines
            .iter()
            .filter_map(|line| line.get("content").and_then(Value::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        Ok(texts.join(" "))
    }
}

#[async_trait]
impl TranscriptFetcher for BilibiliTranscriptFetcher {
    async fn fetch(&self, video: &VideoRef) -> Result<Option<String>> {
        let cid = self.resolve_cid(&video.video_id).await?;
        let tracks = self.list_tracks(&video.video_id, cid).await?;
        let Some(track) = pick_track(&tracks) else {
            return Ok(None);
        };
        let Some(url) = track.get("subtitle_url").and_then(Value::as_str) else {
            return Ok(None);
        };
        if url.is_empty() {
            return Ok(None);
        }
        let text = self.download_track(url.to_string()).await?;
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text))
    }
}

/// AI-generated track first, then any Chinese track, then whatever the
/// platform lists first.
fn pick_track(tracks: &[Value]) -> Option<&Value> {
    let lan = |t: &Value| {
        t.get("lan")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase()
    };
    let lan_doc = |t: &Value| {
        t.get("lan_doc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase()
    };

    tracks
        .iter()
        .find(|t| lan(t).contains("ai") || lan_doc(t).contains("ai"))
        .or_else(|| tracks.iter().find(|t| lan(t).contains("zh")))
        .or_else(|| tracks.first())
}
