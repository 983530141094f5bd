// src/notify/mod.rs
pub mod feishu;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::comments::CommentHit;
use crate::config::Creator;
use crate::feed::{ActivityItem, ItemKind};
use crate::summarize::{MissReason, Summary};

/// Rendered, platform-agnostic message for one activity item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub creator_name: String,
    pub platform: String,
    pub markdown: String,
}

/// Operator alert severity, rendered into system notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

impl SystemLevel {
    fn label(self) -> &'static str {
        match self {
            SystemLevel::Info => "INFO",
            SystemLevel::Warning => "WARNING",
            SystemLevel::Error => "ERROR",
        }
    }
}

/// Delivery errors. The scheduler commits the dedup entry only after
/// `Ok` or `Permanent`; `Transient` leaves the item retry-eligible.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The channel rejected the payload; retrying the same item cannot
    /// succeed.
    #[error("notification payload rejected: {0}")]
    Permanent(#[source] anyhow::Error),
    #[error("notification delivery failed: {0}")]
    Transient(#[source] anyhow::Error),
}

impl NotifyError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, NotifyError::Permanent(_))
    }
}

/// Capability interface: deliver one rendered message to the messaging
/// channel, plus operator-facing system notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &Notification) -> Result<(), NotifyError>;
    async fn notify_system(
        &self,
        level: SystemLevel,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

/// Render a card for one item. Pure and deterministic: same inputs,
/// same markdown, no clock and no network.
pub fn render_card(
    creator: &Creator,
    item: &ActivityItem,
    summary: Option<&Summary>,
) -> Notification {
    let mut sections: Vec<String> = Vec::new();

    match item.kind {
        ItemKind::Video => {
            if let Some(video) = &item.video {
                sections.push(format!("**{}**", video.title));
                sections.push(format!(
                    "[Watch the video]({})\n[View the post]({})",
                    video.url, item.url
                ));
            } else {
                // A video item without a video reference still gets its
                // raw content delivered.
                sections.push(raw_body(item));
                sections.push(format!("[View the post]({})", item.url));
            }
            if creator.watch_comments && !creator.comment_keywords.is_empty() {
                sections.push(format!(
                    "Comment watch: {}",
                    creator.comment_keywords.join(", ")
                ));
            }
        }
        _ => {
            sections.push(raw_body(item));
            sections.push(format!("[View the post]({})", item.url));
        }
    }

    if let Some(summary) = summary {
        sections.push(render_summary(summary));
    }

    if let Some(ts) = DateTime::<Utc>::from_timestamp(item.published_at, 0) {
        sections.push(format!("Published: {} UTC", ts.format("%Y-%m-%d %H:%M:%S")));
    }

    Notification {
        creator_name: creator.name.clone(),
        platform: creator.platform.clone(),
        markdown: sections.join("\n\n"),
    }
}

/// Render a follow-up alert for watched-keyword hits in a video's
/// comments. Pure, like `render_card`.
pub fn render_comment_alert(
    creator: &Creator,
    item: &ActivityItem,
    hits: &[CommentHit],
) -> Notification {
    let title = item
        .video
        .as_ref()
        .map(|v| v.title.as_str())
        .unwrap_or(item.title.as_str());

    let mut sections: Vec<String> = Vec::new();
    sections.push(format!("**Keyword hits in comments on \"{title}\"**"));
    sections.push(
        hits.iter()
            .map(|hit| {
                format!(
                    "- `{}` — {}: {}",
                    hit.keyword, hit.comment.author, hit.comment.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n"),
    );
    sections.push(format!("[View the post]({})", item.url));

    Notification {
        creator_name: creator.name.clone(),
        platform: creator.platform.clone(),
        markdown: sections.join("\n\n"),
    }
}

fn raw_body(item: &ActivityItem) -> String {
    if item.body.is_empty() {
        "(no text content)".to_string()
    } else {
        item.body.clone()
    }
}

fn render_summary(summary: &Summary) -> String {
    match summary {
        Summary::Ready(s) => {
            let mut out = String::from("**AI Summary**\n\n**Key points**\n");
            for point in &s.key_points {
                out.push_str(&format!("- {point}\n"));
            }
            out.push_str(&format!("\n**Highlights**\n{}\n", s.highlights));
            out.push_str(&format!("\n**Detail**\n{}", s.detail));
            out
        }
        Summary::Unavailable(reason) => {
            let why = match reason {
                MissReason::NoTranscript => "no transcript available",
                MissReason::GenerationFailed => "generation failed",
            };
            format!("_AI summary unavailable ({why})_")
        }
    }
}

/// Fallback notifier when no messaging channel is configured: every card
/// lands in the log instead.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            creator = %message.creator_name,
            platform = %message.platform,
            "[card]\n{}",
            message.markdown
        );
        Ok(())
    }

    async fn notify_system(
        &self,
        level: SystemLevel,
        title: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!("[system {}] {title}: {body}", level.label());
        Ok(())
    }
}
