// src/summarize/mod.rs
//! Best-effort video summarization.
//!
//! `summarize` never fails: every outcome is either a populated summary
//! or an explicit `Unavailable` marker with a reason code, so a
//! summarization problem can never abort the enclosing dispatch.

pub mod generate;
pub mod transcript;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::feed::VideoRef;
use generate::GenerationClient;
use transcript::TranscriptFetcher;

/// Structured summary produced by the generation collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub key_points: Vec<String>,
    pub highlights: String,
    pub detail: String,
}

/// Why no summary is available. Expected outcomes, not bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissReason {
    /// The video has no transcript published.
    NoTranscript,
    /// The transcript or generation collaborator failed (timeout, quota,
    /// malformed response, transport).
    GenerationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Summary {
    Ready(VideoSummary),
    Unavailable(MissReason),
}

/// Capability interface: summarize one video item.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, video: &VideoRef) -> Summary;
}

/// Canonical summarizer: transcript fetch, then one structural
/// generation request.
pub struct VideoSummarizer {
    transcripts: Arc<dyn TranscriptFetcher>,
    generator: Arc<dyn GenerationClient>,
}

impl VideoSummarizer {
    pub fn new(transcripts: Arc<dyn TranscriptFetcher>, generator: Arc<dyn GenerationClient>) -> Self {
        Self {
            transcripts,
            generator,
        }
    }
}

#[async_trait]
impl Summarizer for VideoSummarizer {
    async fn summarize(&self, video: &VideoRef) -> Summary {
        let transcript = match self.transcripts.fetch(video).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::info!(video = %video.video_id, "no transcript published, skipping summary");
                return Summary::Unavailable(MissReason::NoTranscript);
            }
            Err(e) => {
                tracing::warn!(video = %video.video_id, error = ?e, "transcript fetch failed");
                return Summary::Unavailable(MissReason::GenerationFailed);
            }
        };

        match self.generator.generate(&transcript).await {
            Ok(summary) => Summary::Ready(summary),
            Err(e) => {
                tracing::warn!(video = %video.video_id, error = ?e, "summary generation failed");
                Summary::Unavailable(MissReason::GenerationFailed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct FixedTranscript(Option<String>);
    #[async_trait]
    impl TranscriptFetcher for FixedTranscript {
        async fn fetch(&self, _video: &VideoRef) -> anyhow::Result<Option<String>> {
            Ok(self.0.clone())
        }
    }

    struct FailingTranscript;
    #[async_trait]
    impl TranscriptFetcher for FailingTranscript {
        async fn fetch(&self, _video: &VideoRef) -> anyhow::Result<Option<String>> {
            Err(anyhow!("subtitle endpoint unreachable"))
        }
    }

    struct FixedGenerator(Result<VideoSummary, ()>);
    #[async_trait]
    impl GenerationClient for FixedGenerator {
        async fn generate(&self, _transcript: &str) -> anyhow::Result<VideoSummary> {
            self.0.clone().map_err(|_| anyhow!("model timeout"))
        }
    }

    fn video() -> VideoRef {
        VideoRef {
            video_id: "BV1test".into(),
            title: "t".into(),
            url: "https://www.bilibili.com/video/BV1test".into(),
        }
    }

    fn ready() -> VideoSummary {
        VideoSummary {
            key_points: vec!["point".into()],
            highlights: "hl".into(),
            detail: "detail".into(),
        }
    }

    #[tokio::test]
    async fn missing_transcript_yields_marker() {
        let s = VideoSummarizer::new(
            Arc::new(FixedTranscript(None)),
            Arc::new(FixedGenerator(Ok(ready()))),
        );
        assert_eq!(
            s.summarize(&video()).await,
            Summary::Unavailable(MissReason::NoTranscript)
        );
    }

    #[tokio::test]
    async fn generation_error_yields_marker() {
        let s = VideoSummarizer::new(
            Arc::new(FixedTranscript(Some("long enough transcript".into()))),
            Arc::new(FixedGenerator(Err(()))),
        );
        assert_eq!(
            s.summarize(&video()).await,
            Summary::Unavailable(MissReason::GenerationFailed)
        );
    }

    #[tokio::test]
    async fn transcript_transport_error_yields_marker() {
        let s = VideoSummarizer::new(
            Arc::new(FailingTranscript),
            Arc::new(FixedGenerator(Ok(ready()))),
        );
        assert_eq!(
            s.summarize(&video()).await,
            Summary::Unavailable(MissReason::GenerationFailed)
        );
    }

    #[tokio::test]
    async fn happy_path_returns_ready() {
        let s = VideoSummarizer::new(
            Arc::new(FixedTranscript(Some("transcript text".into()))),
            Arc::new(FixedGenerator(Ok(ready()))),
        );
        assert_eq!(s.summarize(&video()).await, Summary::Ready(ready()));
    }
}
