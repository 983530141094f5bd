// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod auth;
pub mod comments;
pub mod config;
pub mod dedup;
pub mod feed;
pub mod monitor;
pub mod notify;
pub mod persist;
pub mod summarize;

// ---- Re-exports for stable public API ----
pub use crate::config::{AppConfig, Creator};
pub use crate::dedup::DedupStore;
pub use crate::feed::{ActivityItem, FeedSource, FetchError, ItemKind};
pub use crate::monitor::{MonitorConfig, MonitorScheduler, SweepStats};
pub use crate::notify::{Notification, Notifier, NotifyError};
pub use crate::summarize::{Summarizer, Summary};
