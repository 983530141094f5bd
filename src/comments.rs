// src/comments.rs
//! Keyword watch over video comments.
//!
//! For creators with comment watching enabled, new videos get one pass
//! over their hottest comments; any comment containing a watched keyword
//! raises a follow-up alert. Matching is case-insensitive substring.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::auth::CredentialStore;
use crate::feed::VideoRef;

const VIDEO_VIEW_URL: &str = "https://api.bilibili.com/x/web-interface/view";
const REPLY_URL: &str = "https://api.bilibili.com/x/v2/reply";

/// One page of the hot-sorted list is enough for a watch pass.
const PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub author: String,
    pub text: String,
}

/// A comment that matched one of the watched keywords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentHit {
    pub keyword: String,
    pub comment: Comment,
}

/// Capability interface: current comments under one video.
#[async_trait]
pub trait CommentSource: Send + Sync {
    async fn fetch_recent(&self, video: &VideoRef) -> Result<Vec<Comment>>;
}

/// Case-insensitive substring match; a comment counts once, against the
/// first keyword it matches.
pub fn match_keywords(comments: &[Comment], keywords: &[String]) -> Vec<CommentHit> {
    let lowered: Vec<(usize, String)> = keywords
        .iter()
        .enumerate()
        .filter(|(_, k)| !k.trim().is_empty())
        .map(|(i, k)| (i, k.to_lowercase()))
        .collect();

    let mut hits = Vec::new();
    for comment in comments {
        let text = comment.text.to_lowercase();
        if let Some((i, _)) = lowered.iter().find(|(_, k)| text.contains(k.as_str())) {
            hits.push(CommentHit {
                keyword: keywords[*i].clone(),
                comment: comment.clone(),
            });
        }
    }
    hits
}

/// Canonical source against the upstream reply API: resolve the video's
/// numeric id, then pull the first page sorted by likes.
pub struct BilibiliCommentSource {
    http: reqwest::Client,
    credentials: Arc<CredentialStore>,
    user_agent: String,
}

impl BilibiliCommentSource {
    pub fn new(credentials: Arc<CredentialStore>, user_agent: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()
            .context("building comment http client")?;
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

    async fn resolve_aid(&self, video_id: &str) -> Result<i64> {
        let body = self.get_json(VIDEO_VIEW_URL, &[("bvid", video_id)]).await?;
        body.pointer("/data/aid")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("video {video_id} has no aid"))
    }
}

#[async_trait]
impl CommentSource for BilibiliCommentSource {
    async fn fetch_recent(&self, video: &VideoRef) -> Result<Vec<Comment>> {
        let aid = self.resolve_aid(&video.video_id).await?;
        let oid = aid.to_string();
        let ps = PAGE_SIZE.to_string();
        let body = self
            .get_json(
                REPLY_URL,
                &[
                    ("type", "1"),
                    ("oid", &oid),
                    ("sort", "2"),
                    ("ps", &ps),
                    ("pn", "1"),
                ],
            )
            .await?;
        Ok(parse_comments(&body))
    }
}

fn parse_comments(body: &Value) -> Vec<Comment> {
    let Some(replies) = body.pointer("/data/replies").and_then(Value::as_array) else {
        return Vec::new();
    };
    replies
        .iter()
        .filter_map(|reply| {
            let text = reply
                .pointer("/content/message")
                .and_then(Value::as_str)?
                .trim();
            if text.is_empty() {
                return None;
            }
            let author = reply
                .pointer("/member/uname")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string();
            Some(Comment {
                author,
                text: text.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn comment(author: &str, text: &str) -> Comment {
        Comment {
            author: author.into(),
            text: text.into(),
        }
    }

    #[test]
    fn matching_is_case_insensitive_substring() {
        let comments = vec![
            comment("a", "When is the GIVEAWAY happening?"),
            comment("b", "great video"),
            comment("c", "q&a please"),
        ];
        let keywords = vec!["giveaway".to_string(), "Q&A".to_string()];
        let hits = match_keywords(&comments, &keywords);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].keyword, "giveaway");
        assert_eq!(hits[0].comment.author, "a");
        assert_eq!(hits[1].keyword, "Q&A");
    }

    #[test]
    fn comment_matches_first_keyword_only_once() {
        let comments = vec![comment("a", "giveaway and q&a in one")];
        let keywords = vec!["giveaway".to_string(), "q&a".to_string()];
        let hits = match_keywords(&comments, &keywords);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].keyword, "giveaway");
    }

    #[test]
    fn blank_keywords_are_ignored() {
        let comments = vec![comment("a", "anything")];
        assert!(match_keywords(&comments, &["  ".to_string()]).is_empty());
        assert!(match_keywords(&comments, &[]).is_empty());
    }

    #[test]
    fn parses_reply_page() {
        let body = json!({
            "code": 0,
            "data": {
                "replies": [
                    {
                        "content": { "message": "  first!  " },
                        "member": { "uname": "fan one" }
                    },
                    { "content": { "message": "" }, "member": { "uname": "empty" } },
                    { "content": { "message": "nice" } }
                ]
            }
        });
        let comments = parse_comments(&body);
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0], comment("fan one", "first!"));
        assert_eq!(comments[1], comment("?", "nice"));
    }

    #[test]
    fn missing_replies_is_empty_not_error() {
        assert!(parse_comments(&json!({"code": 0, "data": {}})).is_empty());
    }
}
