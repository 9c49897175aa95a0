//! Atlas scheduler process.
//!
//! Wires the core together and runs until interrupted. Configuration
//! discovery is the embedder's job; this binary accepts a single
//! optional argument naming a YAML source list and otherwise runs with
//! defaults. Exit status is zero on clean shutdown and nonzero on an
//! unrecoverable startup error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use atlas::cancel::CancelSource;
use atlas::collectors::{CollectorRegistry, HttpClient, RateLimiter};
use atlas::config::AtlasConfig;
use atlas::llm::{AdaptiveController, LlmClient, LlmEmbeddingProvider, LlmQueue};
use atlas::pipeline::Pipeline;
use atlas::processors::dedup::Deduplicator;
use atlas::processors::validator::Validator;
use atlas::scheduler::queue::{TaskPriority, TaskQueue};
use atlas::scheduler::status::StatusManager;
use atlas::scheduler::CronScheduler;
use atlas::storage::{SqliteStorage, Storage};

#[tokio::main]
async fn main() {
    atlas::logging::init("info");
    if let Err(e) = run().await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let mut config = AtlasConfig::default();
    if let Some(path) = std::env::args().nth(1) {
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("reading source list {path}"))?;
        config.sources = atlas::models::source::parse_source_list(&yaml)?;
    }
    config.validate().context("invalid configuration")?;
    std::fs::create_dir_all(&config.data_dir).context("creating data directory")?;

    // Persistence must be reachable at startup; later failures are
    // runtime errors and never crash the process.
    let storage: Arc<dyn Storage> = Arc::new(
        SqliteStorage::open(&config.data_dir.join("atlas.db")).context("opening storage")?,
    );
    for source in &config.sources {
        storage.put_source(source).await?;
    }

    let shutdown = CancelSource::new();

    // Status tracking and the task queue.
    let status = Arc::new(StatusManager::load(config.status_path()));
    let queue = TaskQueue::new(config.queue.clone(), status.clone());
    queue.start();
    tokio::spawn(status.clone().flush_loop(shutdown.token()));

    // HTTP stack shared by every collector.
    let limiter = RateLimiter::new(config.rate_limit.clone());
    let mut http_config = config.http.clone();
    http_config.cache_dir = Some(config.http_cache_dir());
    let http = HttpClient::new(
        http_config,
        &config.resolve_user_agent(None),
        limiter,
    )?;

    // Background sweeps for the HTTP response cache.
    {
        let http = http.clone();
        let token = shutdown.token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { http.sweep_cache(); }
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    // LLM gateway under adaptive control.
    let llm_client = Arc::new(LlmClient::new(config.llm.clone())?);
    let llm_queue = LlmQueue::new(
        llm_client.clone(),
        config.llm.max_concurrent,
        Duration::from_secs(3600),
    );
    {
        let llm_queue = llm_queue.clone();
        let token = shutdown.token();
        tokio::spawn(async move { llm_queue.run(token).await });
    }
    {
        // Expired LLM results age out of the cache periodically.
        let llm_queue = llm_queue.clone();
        let token = shutdown.token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(900));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { llm_queue.sweep_cache(); }
                    _ = token.cancelled() => break,
                }
            }
        });
    }
    let controller = Arc::new(AdaptiveController::new(
        config.controller.clone(),
        llm_client.clone(),
        llm_queue.clone(),
        Arc::new(atlas::llm::controller::ProcSystemProbe::new()),
    ));
    {
        let controller = controller.clone();
        let token = shutdown.token();
        tokio::spawn(async move { controller.run(token).await });
    }

    // Content pipeline.
    let dedup = Deduplicator::new(config.dedup.clone())
        .with_primary_provider(Arc::new(LlmEmbeddingProvider::new(llm_queue.clone())));
    let pipeline = Arc::new(Pipeline::new(
        CollectorRegistry::with_defaults(),
        http,
        storage.clone(),
        Validator::new(config.validator.clone()),
        dedup,
    ));
    let warmed = pipeline.warm_dedup_index().await?;
    info!(documents = warmed, "dedup index warmed");

    // One cron job per enabled source, interval expressed in minutes.
    let cron = Arc::new(CronScheduler::new(queue.clone(), config.cron_file.clone()));
    for source in config.sources.iter().filter(|s| s.enabled) {
        let minutes = (source.interval / 60).max(1);
        let expression = if minutes >= 60 && minutes % 60 == 0 {
            format!("0 */{} * * *", minutes / 60)
        } else {
            format!("*/{} * * * *", minutes.min(59))
        };

        let pipeline = pipeline.clone();
        let source = source.clone();
        let name = source.name.clone();
        cron.add_job(
            &name,
            &expression,
            TaskPriority::Normal,
            Arc::new(move |cancel| {
                let pipeline = pipeline.clone();
                let source = source.clone();
                Box::pin(async move {
                    let stats = pipeline.run_source(&source, &cancel).await?;
                    Ok(serde_json::to_value(stats)?)
                })
            }),
        )
        .await?;
    }

    {
        let cron = cron.clone();
        let token = shutdown.token();
        tokio::spawn(async move { cron.run(token).await });
    }

    info!(sources = config.sources.len(), "atlas started");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested");

    shutdown.cancel();
    queue.shutdown(Duration::from_secs(30)).await;
    status.flush().context("final status flush")?;
    cron.save_registry().await?;
    info!("shutdown complete");
    Ok(())
}
