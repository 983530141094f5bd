// src/summarize/generate.rs
//! Text-generation collaborator: one fixed structural request against an
//! OpenAI-compatible chat endpoint. The client asks for a JSON object
//! with key points / highlights / detail and parses it back; anything
//! malformed is an ordinary error the summarizer degrades on.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::VideoSummary;

/// Transcripts are truncated before submission to stay inside model
/// context limits.
const MAX_TRANSCRIPT_CHARS: usize = 30_000;

const SYSTEM_PROMPT: &str = "You summarize video transcripts. Respond with a single JSON \
object and nothing else, with fields: key_points (array of 3-5 short strings), highlights \
(one or two paragraphs), detail (a longer structured summary). Use only information from \
the transcript.";

#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(&self, transcript: &str) -> Result<VideoSummary>;
}

/// Per-service defaults, overridable via configuration.
pub fn service_defaults(service: &str) -> (&'static str, &'static str) {
    match service {
        "zhipu" => ("https://open.bigmodel.cn/api/paas/v4", "glm-4"),
        "qwen" => (
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            "qwen-turbo",
        ),
        // deepseek is the default service.
        _ => ("https://api.deepseek.com/v1", "deepseek-chat"),
    }
}

pub struct ChatCompletionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ChatCompletionClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self> {
        if api_key.is_empty() {
            bail!("generation API key is empty");
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(60))
            .build()
            .context("building generation http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl GenerationClient for ChatCompletionClient {
    async fn generate(&self, transcript: &str) -> Result<VideoSummary> {
        let truncated = truncate_chars(transcript, MAX_TRANSCRIPT_CHARS);
        let user = format!("Transcript:\n{truncated}");
        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.7,
            max_tokens: 2000,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("chat completion request")?
            .error_for_status()
            .context("chat completion status")?;

        let body: ChatResponse = resp.json().await.context("chat completion body")?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow!("chat completion returned no choices"))?;
        parse_summary(content)
    }
}

/// Parse the model output, tolerating a markdown code fence around the
/// JSON object.
pub fn parse_summary(content: &str) -> Result<VideoSummary> {
    let trimmed = strip_code_fence(content.trim());
    let summary: VideoSummary =
        serde_json::from_str(trimmed).context("parsing generated summary JSON")?;
    if summary.key_points.is_empty() && summary.highlights.is_empty() && summary.detail.is_empty() {
        bail!("generated summary is empty");
    }
    Ok(summary)
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    // Drop the info string (e.g. "json") on the fence line.
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    rest.trim_end().trim_end_matches("```").trim()
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...\n[transcript truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let out = parse_summary(
            r#"{"key_points": ["a", "b"], "highlights": "h", "detail": "d"}"#,
        )
        .unwrap();
        assert_eq!(out.key_points, vec!["a", "b"]);
        assert_eq!(out.highlights, "h");
    }

    #[test]
    fn parses_fenced_json() {
        let fenced = "```json\n{\"key_points\": [\"a\"], \"highlights\": \"h\", \"detail\": \"d\"}\n```";
        let out = parse_summary(fenced).unwrap();
        assert_eq!(out.key_points, vec!["a"]);
    }

    #[test]
    fn rejects_prose_and_empty() {
        assert!(parse_summary("Sure! Here is the summary...").is_err());
        assert!(
            parse_summary(r#"{"key_points": [], "highlights": "", "detail": ""}"#).is_err()
        );
    }

    #[test]
    fn truncation_is_char_based() {
        let long = "字".repeat(10);
        let out = truncate_chars(&long, 4);
        assert!(out.starts_with("字字字字"));
        assert!(out.ends_with("[transcript truncated]"));
        assert_eq!(truncate_chars("short", 100), "short");
    }

    #[test]
    fn service_defaults_cover_known_services() {
        assert_eq!(service_defaults("deepseek").1, "deepseek-chat");
        assert_eq!(service_defaults("zhipu").1, "glm-4");
        assert_eq!(service_defaults("qwen").1, "qwen-turbo");
        assert_eq!(service_defaults("unknown").1, "deepseek-chat");
    }
}
