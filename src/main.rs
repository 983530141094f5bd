//! Creator Monitor — Binary Entrypoint
//!
//! Loads configuration, wires the credential store, feed source,
//! summarizer and notifier together, and runs the monitoring loops
//! until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use creator_monitor::auth::refresher::{
    BilibiliAuthExchange, CredentialRefresher, RefreshConfig,
};
use creator_monitor::auth::CredentialStore;
use creator_monitor::comments::BilibiliCommentSource;
use creator_monitor::config::{self, AppConfig};
use creator_monitor::dedup::DedupStore;
use creator_monitor::feed::bilibili::BilibiliFeedSource;
use creator_monitor::monitor::{MonitorConfig, MonitorScheduler};
use creator_monitor::notify::feishu::FeishuNotifier;
use creator_monitor::notify::{LogNotifier, Notifier, SystemLevel};
use creator_monitor::summarize::generate::{service_defaults, ChatCompletionClient};
use creator_monitor::summarize::transcript::BilibiliTranscriptFetcher;
use creator_monitor::summarize::VideoSummarizer;

#[derive(Parser, Debug)]
#[command(name = "creator-monitor", about = "Creator update monitor", version)]
struct Cli {
    /// Run a single sweep over all creators and exit.
    #[arg(long)]
    once: bool,
    /// Clear dedup state for one creator id, or "all", then exit.
    #[arg(long, value_name = "ID|all")]
    reset: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("creator_monitor=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = AppConfig::from_env()?;
    let creators = config::load_creators(&cfg.creators_path)?;
    tracing::info!(creators = creators.len(), "configuration loaded");

    let dedup = Arc::new(
        DedupStore::open(cfg.state_path.clone(), cfg.seen_cap).context("opening dedup store")?,
    );

    if let Some(target) = cli.reset.as_deref() {
        let creator_id = if target.eq_ignore_ascii_case("all") {
            None
        } else {
            Some(target)
        };
        dedup
            .reset(creator_id)
            .await
            .context("resetting dedup state")?;
        tracing::info!(reset = target, "dedup state reset");
        return Ok(());
    }

    let credentials = Arc::new(
        CredentialStore::open_with_initial(cfg.credentials_path.clone(), cfg.initial_credential())
            .context("opening credential store")?,
    );

    let exchange = BilibiliAuthExchange::new(cfg.user_agent.clone())?;
    let refresher = Arc::new(CredentialRefresher::new(
        Arc::clone(&credentials),
        Arc::new(exchange),
        RefreshConfig {
            tick: cfg.refresh_tick,
            min_validity: cfg.refresh_min_validity,
            ..RefreshConfig::default()
        },
    ));

    let feed = Arc::new(BilibiliFeedSource::new(
        Arc::clone(&credentials),
        cfg.user_agent.clone(),
    )?);

    let notifier: Arc<dyn Notifier> = match &cfg.feishu_webhook {
        Some(webhook) => Arc::new(FeishuNotifier::new(webhook.clone())),
        None => {
            tracing::warn!("no webhook configured, cards go to the log");
            Arc::new(LogNotifier)
        }
    };

    let watch_comments = creators.iter().any(|c| c.watch_comments);

    let monitor_cfg = MonitorConfig {
        max_item_age: cfg.max_item_age,
        first_sweep_max: cfg.first_sweep_max,
        stagger: cfg.stagger,
        jitter: true,
    };
    let mut scheduler = MonitorScheduler::new(
        creators,
        feed,
        Arc::clone(&dedup),
        Arc::clone(&notifier),
        monitor_cfg,
    )
    .with_refresher(Arc::clone(&refresher));

    if watch_comments {
        let comments =
            BilibiliCommentSource::new(Arc::clone(&credentials), cfg.user_agent.clone())?;
        scheduler = scheduler.with_comment_source(Arc::new(comments));
        tracing::info!("comment keyword watch enabled");
    }

    if cfg.ai.enabled() {
        let (default_base, default_model) = service_defaults(&cfg.ai.service);
        let base_url = cfg
            .ai
            .base_url
            .clone()
            .unwrap_or_else(|| default_base.to_string());
        let model = cfg
            .ai
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string());
        let api_key = cfg.ai.api_key.clone().unwrap_or_default();
        let generator = ChatCompletionClient::new(base_url, api_key, model)
            .context("building generation client")?;
        let transcripts =
            BilibiliTranscriptFetcher::new(Arc::clone(&credentials), cfg.user_agent.clone())?;
        let summarizer = VideoSummarizer::new(Arc::new(transcripts), Arc::new(generator));
        scheduler = scheduler.with_summarizer(Arc::new(summarizer));
        tracing::info!(service = %cfg.ai.service, "video summaries enabled");
    } else {
        tracing::info!("no AI key configured, video summaries disabled");
    }

    let scheduler = Arc::new(scheduler);

    if cli.once {
        let stats = scheduler.run_once().await;
        tracing::info!(dispatched = stats.dispatched, "single sweep done");
        return Ok(());
    }

    let _ = notifier
        .notify_system(
            SystemLevel::Info,
            "Monitor started",
            &format!("watching {} creator(s)", scheduler.creators().len()),
        )
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresh_task = tokio::spawn(CredentialRefresher::run(
        Arc::clone(&refresher),
        shutdown_rx.clone(),
    ));
    let monitor_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = monitor_task.await;
    let _ = refresh_task.await;
    tracing::info!("monitor stopped");
    Ok(())
}
