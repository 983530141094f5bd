// src/monitor.rs
//! The monitoring engine: per-creator polling loops, new-item detection
//! against the dedup store, summarizer routing for videos, and
//! commit-after-success dispatch to the notifier.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use rand::Rng;
use tokio::sync::watch;

use crate::auth::refresher::CredentialRefresher;
use crate::comments::{match_keywords, CommentSource};
use crate::config::Creator;
use crate::dedup::DedupStore;
use crate::feed::{ActivityItem, FeedSource, FetchError, ItemKind};
use crate::notify::{render_card, render_comment_alert, Notifier, SystemLevel};
use crate::summarize::{Summarizer, Summary};

/// One-time metrics registration.
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "monitor_dispatched_total",
            "Items delivered to the messaging channel."
        );
        describe_counter!(
            "monitor_deduped_total",
            "Items suppressed by the dedup window."
        );
        describe_counter!("monitor_fetch_errors_total", "Feed fetch failures.");
        describe_counter!(
            "monitor_notify_failures_total",
            "Transient notification delivery failures."
        );
        describe_counter!(
            "monitor_commit_failures_total",
            "Dedup state flush failures."
        );
        describe_counter!(
            "monitor_summary_unavailable_total",
            "Video dispatches that fell back to the unavailable marker."
        );
        describe_counter!(
            "monitor_comment_hits_total",
            "Watched-keyword matches found in video comments."
        );
        describe_counter!(
            "monitor_comment_errors_total",
            "Comment fetch failures (best-effort, never blocks dispatch)."
        );
        describe_gauge!("monitor_last_cycle_ts", "Unix ts of the last finished cycle.");
    });
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Items older than this are discarded before detection; unset
    /// means the whole visible feed window is eligible.
    pub max_item_age: Option<Duration>,
    /// Cap on dispatches for a creator whose record is empty; older
    /// backlog items are acknowledged without delivery.
    pub first_sweep_max: Option<usize>,
    /// Delay between starting consecutive creator loops.
    pub stagger: Duration,
    /// ±20% randomization of the poll interval.
    pub jitter: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_item_age: None,
            first_sweep_max: None,
            stagger: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Per-cycle outcome for one creator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub dispatched: usize,
    pub deduped: usize,
    pub fetch_failed: bool,
}

/// Totals for one full sweep over the creator set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub creators_checked: usize,
    pub dispatched: usize,
    pub deduped: usize,
    pub failures: usize,
}

enum DispatchOutcome {
    Delivered,
    /// Committed as seen without delivery (channel rejected the payload
    /// permanently).
    Acknowledged,
    /// Transient delivery or storage failure: stop the batch so older
    /// items retry before newer ones next cycle.
    Abort,
}

pub struct MonitorScheduler {
    creators: Vec<Creator>,
    feed: Arc<dyn FeedSource>,
    dedup: Arc<DedupStore>,
    notifier: Arc<dyn Notifier>,
    summarizer: Option<Arc<dyn Summarizer>>,
    comments: Option<Arc<dyn CommentSource>>,
    refresher: Option<Arc<CredentialRefresher>>,
    cfg: MonitorConfig,
}

impl MonitorScheduler {
    pub fn new(
        creators: Vec<Creator>,
        feed: Arc<dyn FeedSource>,
        dedup: Arc<DedupStore>,
        notifier: Arc<dyn Notifier>,
        cfg: MonitorConfig,
    ) -> Self {
        ensure_metrics_described();
        Self {
            creators,
            feed,
            dedup,
            notifier,
            summarizer: None,
            comments: None,
            refresher: None,
            cfg,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Wire a comment source so creators with comment watching enabled
    /// get keyword alerts on their new videos.
    pub fn with_comment_source(mut self, comments: Arc<dyn CommentSource>) -> Self {
        self.comments = Some(comments);
        self
    }

    /// Wire the refresher so `AuthInvalid` fetch errors trigger an
    /// immediate out-of-band refresh.
    pub fn with_refresher(mut self, refresher: Arc<CredentialRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn creators(&self) -> &[Creator] {
        &self.creators
    }

    /// Administrative reset: clear one creator's dedup record (or all),
    /// so the next cycle treats currently-visible items as new.
    pub async fn reset(&self, creator_id: Option<&str>) -> Result<()> {
        if let Some(id) = creator_id {
            if !self.creators.iter().any(|c| c.id == id) {
                tracing::warn!(creator = id, "resetting a creator not in the configured list");
            }
        }
        self.dedup.reset(creator_id).await
    }

    /// One sweep over every configured creator. Failures stay isolated:
    /// one creator's bad cycle never affects another's.
    pub async fn run_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        for creator in &self.creators {
            let cycle = self.check_creator(creator, None).await;
            stats.creators_checked += 1;
            stats.dispatched += cycle.dispatched;
            stats.deduped += cycle.deduped;
            if cycle.fetch_failed {
                stats.failures += 1;
            }
        }
        gauge!("monitor_last_cycle_ts").set(chrono::Utc::now().timestamp() as f64);
        tracing::info!(
            checked = stats.creators_checked,
            dispatched = stats.dispatched,
            deduped = stats.deduped,
            failures = stats.failures,
            "sweep complete"
        );
        stats
    }

    /// Long-running mode: one loop per creator on its own cadence, all
    /// loops honoring the cooperative shutdown signal. An in-flight
    /// cycle finishes its current item before the loop exits.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::with_capacity(self.creators.len());
        for (i, creator) in self.creators.iter().cloned().enumerate() {
            let scheduler = Arc::clone(&self);
            let mut shutdown = shutdown.clone();
            let start_delay = self.cfg.stagger * i as u32;
            handles.push(tokio::spawn(async move {
                if !start_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(start_delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                loop {
                    let cycle = scheduler.check_creator(&creator, Some(&shutdown)).await;
                    if *shutdown.borrow() {
                        break;
                    }
                    tracing::debug!(
                        creator = %creator.name,
                        dispatched = cycle.dispatched,
                        deduped = cycle.deduped,
                        "cycle finished"
                    );
                    let pause = scheduler.pause_for(&creator);
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                tracing::debug!(creator = %creator.name, "creator loop stopped");
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn pause_for(&self, creator: &Creator) -> Duration {
        let base = creator.interval_secs.max(1);
        if !self.cfg.jitter {
            return Duration::from_secs(base);
        }
        let factor: f64 = rand::rng().random_range(0.8..1.2);
        Duration::from_secs_f64(base as f64 * factor)
    }

    async fn check_creator(
        &self,
        creator: &Creator,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> CycleStats {
        let items = match self.feed.fetch_recent(&creator.id).await {
            Ok(items) => items,
            Err(e) => {
                counter!("monitor_fetch_errors_total").increment(1);
                if matches!(e, FetchError::AuthInvalid) {
                    if let Some(refresher) = &self.refresher {
                        refresher.hint_auth_invalid();
                    }
                }
                tracing::warn!(
                    creator = %creator.name,
                    source = self.feed.name(),
                    error = %e,
                    "feed fetch failed, skipping this round"
                );
                let _ = self
                    .notifier
                    .notify_system(
                        SystemLevel::Warning,
                        "Feed fetch failed",
                        &format!("creator: {} ({})\nerror: {e}", creator.name, creator.id),
                    )
                    .await;
                return CycleStats {
                    fetch_failed: true,
                    ..Default::default()
                };
            }
        };
        self.process_items(creator, items, shutdown).await
    }

    async fn process_items(
        &self,
        creator: &Creator,
        items: Vec<ActivityItem>,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> CycleStats {
        let mut stats = CycleStats::default();
        let now = chrono::Utc::now().timestamp();

        let mut candidates: Vec<ActivityItem> = items
            .into_iter()
            .filter(|i| !i.pinned)
            .filter(|i| match self.cfg.max_item_age {
                Some(age) => now - i.published_at <= age.as_secs() as i64,
                None => true,
            })
            .collect();
        // Oldest first: if dispatch fails partway, the older items are
        // the ones retried first next cycle.
        candidates.sort_by(|a, b| a.published_at.cmp(&b.published_at));

        let record = self.dedup.load(&creator.id).await;
        let first_sweep = record.last_seen_id.is_none() && record.seen.is_empty();

        let mut fresh: Vec<ActivityItem> = Vec::new();
        // Feed responses occasionally repeat an entry; a local set keeps
        // a repeated ID from dispatching twice within the cycle.
        let mut picked: HashSet<String> = HashSet::new();
        for item in candidates {
            if !picked.insert(item.id.clone()) {
                stats.deduped += 1;
                counter!("monitor_deduped_total").increment(1);
                continue;
            }
            if self.dedup.is_new(&creator.id, &item.id).await {
                fresh.push(item);
            } else {
                stats.deduped += 1;
                counter!("monitor_deduped_total").increment(1);
            }
        }

        // First contact with a creator can surface a deep backlog; cap
        // it when configured, acknowledging the skipped older items so
        // they never dispatch later.
        if first_sweep {
            if let Some(cap) = self.cfg.first_sweep_max {
                while fresh.len() > cap {
                    let skipped = fresh.remove(0);
                    tracing::info!(
                        creator = %creator.name,
                        item = %skipped.id,
                        "acknowledging backlog item without delivery"
                    );
                    if let Err(e) = self.dedup.commit(&creator.id, &skipped.id).await {
                        self.report_commit_failure(creator, &skipped.id, &e).await;
                        return stats;
                    }
                }
            }
        }

        if fresh.is_empty() {
            tracing::debug!(creator = %creator.name, "no new items");
            return stats;
        }
        tracing::info!(creator = %creator.name, new = fresh.len(), "found new items");

        for item in &fresh {
            // Shutdown grace covers the item in flight, not the batch;
            // the rest stays undelivered and retries on next start.
            if shutdown.is_some_and(|rx| *rx.borrow()) {
                tracing::debug!(creator = %creator.name, "shutdown requested, leaving batch");
                break;
            }
            match self.dispatch_item(creator, item).await {
                DispatchOutcome::Delivered => {
                    stats.dispatched += 1;
                    counter!("monitor_dispatched_total").increment(1);
                }
                DispatchOutcome::Acknowledged => {}
                DispatchOutcome::Abort => break,
            }
        }
        stats
    }

    async fn dispatch_item(&self, creator: &Creator, item: &ActivityItem) -> DispatchOutcome {
        let summary = self.summarize_if_video(item).await;
        let card = render_card(creator, item, summary.as_ref());

        let mut delivered = true;
        match self.notifier.notify(&card).await {
            Ok(()) => {}
            Err(e) if e.is_permanent() => {
                delivered = false;
                // Poisoned item: record it as seen anyway so it cannot
                // wedge the creator's queue forever.
                counter!("monitor_notify_failures_total").increment(1);
                tracing::warn!(
                    creator = %creator.name,
                    item = %item.id,
                    error = %e,
                    "channel rejected item permanently, acknowledging without delivery"
                );
            }
            Err(e) => {
                counter!("monitor_notify_failures_total").increment(1);
                tracing::warn!(
                    creator = %creator.name,
                    item = %item.id,
                    error = %e,
                    "notification failed, item will retry next cycle"
                );
                return DispatchOutcome::Abort;
            }
        }

        // Commit happens-after a successful (or permanently rejected)
        // delivery, never before. A crash in between re-delivers at
        // most this one item on restart.
        if let Err(e) = self.dedup.commit(&creator.id, &item.id).await {
            self.report_commit_failure(creator, &item.id, &e).await;
            return DispatchOutcome::Abort;
        }
        if delivered {
            self.watch_comments(creator, item).await;
            DispatchOutcome::Delivered
        } else {
            DispatchOutcome::Acknowledged
        }
    }

    /// Best-effort keyword watch over a freshly delivered video's
    /// comments. A fetch failure or a delivery failure of the alert
    /// never affects the already-committed dispatch.
    async fn watch_comments(&self, creator: &Creator, item: &ActivityItem) {
        if !creator.watch_comments || creator.comment_keywords.is_empty() {
            return;
        }
        let Some(source) = &self.comments else { return };
        let Some(video) = &item.video else { return };

        let comments = match source.fetch_recent(video).await {
            Ok(comments) => comments,
            Err(e) => {
                counter!("monitor_comment_errors_total").increment(1);
                tracing::warn!(
                    creator = %creator.name,
                    video = %video.video_id,
                    error = ?e,
                    "comment fetch failed, skipping keyword watch"
                );
                return;
            }
        };

        let hits = match_keywords(&comments, &creator.comment_keywords);
        if hits.is_empty() {
            tracing::debug!(
                creator = %creator.name,
                video = %video.video_id,
                scanned = comments.len(),
                "no watched keywords in comments"
            );
            return;
        }
        counter!("monitor_comment_hits_total").increment(hits.len() as u64);
        tracing::info!(
            creator = %creator.name,
            video = %video.video_id,
            hits = hits.len(),
            "watched keywords found in comments"
        );

        let alert = render_comment_alert(creator, item, &hits);
        if let Err(e) = self.notifier.notify(&alert).await {
            tracing::warn!(
                creator = %creator.name,
                video = %video.video_id,
                error = %e,
                "comment alert delivery failed"
            );
        }
    }

    async fn summarize_if_video(&self, item: &ActivityItem) -> Option<Summary> {
        if item.kind != ItemKind::Video {
            return None;
        }
        let video = item.video.as_ref()?;
        let summarizer = self.summarizer.as_ref()?;
        let summary = summarizer.summarize(video).await;
        if matches!(summary, Summary::Unavailable(_)) {
            counter!("monitor_summary_unavailable_total").increment(1);
        }
        Some(summary)
    }

    /// Storage failures mean dispatch is no longer idempotent-safe for
    /// this creator; shout and stop its cycle. Other creators keep
    /// running.
    async fn report_commit_failure(&self, creator: &Creator, item_id: &str, e: &anyhow::Error) {
        counter!("monitor_commit_failures_total").increment(1);
        tracing::error!(
            creator = %creator.name,
            item = item_id,
            error = ?e,
            "dedup commit failed; duplicate delivery possible on restart"
        );
        let _ = self
            .notifier
            .notify_system(
                SystemLevel::Error,
                "Dedup state flush failed",
                &format!(
                    "creator: {} ({})\nitem: {item_id}\nerror: {e:#}",
                    creator.name, creator.id
                ),
            )
            .await;
    }
}
