// src/feed/mod.rs
pub mod bilibili;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Kind of an activity item, as far as routing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemKind {
    Video,
    Text,
    Repost,
    Other,
}

/// Reference to the video behind a `Video` item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRef {
    pub video_id: String, // platform video ID, e.g. a BV id
    pub title: String,
    pub url: String,
}

/// One unit of content from a creator's feed. Immutable once fetched;
/// only the ID is ever persisted (by the dedup store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityItem {
    pub id: String, // platform-scoped unique item ID
    pub kind: ItemKind,
    pub published_at: i64, // unix seconds
    pub title: String,
    pub url: String,
    pub body: String,
    pub video: Option<VideoRef>,
    /// Pinned posts are old announcements re-surfaced at the top of the
    /// feed; they are skipped by new-item detection.
    pub pinned: bool,
}

/// Typed fetch errors at the feed boundary. `AuthInvalid` additionally
/// triggers an out-of-band refresh hint in the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("feed API rejected the current credential")]
    AuthInvalid,
    #[error("rate limited by the feed API")]
    RateLimited,
    #[error("creator not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Capability interface: given a creator identifier, return the creator's
/// current activity items, most recent first.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_recent(&self, creator_id: &str) -> Result<Vec<ActivityItem>, FetchError>;
    fn name(&self) -> &'static str;
}
