use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod aggregation;
mod bounded_map;
mod classifier;
mod cli;
mod composite;
mod event_bus;
mod events;
mod feed;
mod market_impact;
mod metadata_cache;
mod metrics;
mod profiles;
mod rank_book;
mod scheduler;
mod sources;
mod stats;
mod store;
mod tiers;
mod worker;

#[allow(clippy::too_many_lines)] // startup wiring
#[tokio::main]
async fn main() -> Result<()> {
    let (config_path, argv) =
        cli::take_config_flag(std::env::args().collect()).map_err(anyhow::Error::msg)?;
    let config = match config_path {
        Some(path) => common::config::Config::load_from(&path)?,
        None => common::config::Config::load()?,
    };

    let (dispatch, _otel_guard) = common::observability::build_dispatch(
        "enricher",
        &config.general.log_level,
        &config.observability,
    );
    tracing::dispatcher::set_global_default(dispatch).map_err(anyhow::Error::msg)?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = common::db::AsyncDb::open(&config.database.path).await?;

    let cmd = cli::parse_args(argv.into_iter()).map_err(anyhow::Error::msg)?;
    if cmd != cli::Command::Run {
        cli::run_command(&db, cmd, &config.signals.windows_hours).await?;
        return Ok(());
    }

    tracing::info!("whale enricher starting");

    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let cfg = Arc::new(config);
    let cancel = CancellationToken::new();

    let limiter = Arc::new(common::rate_limit::AdaptiveRateLimiter::from_config(
        &cfg.rate_limit,
    ));
    let api = Arc::new(common::polymarket::PolymarketClient::new(
        &cfg.polymarket,
        limiter,
    )?);

    let bus = event_bus::EventBus::from_config(&cfg.events);

    // ── Logging subscriber first so startup refresh events are seen ──
    let logging_task = tokio::spawn({
        let bus = bus.clone();
        let cancel = cancel.clone();
        let log_trades = cfg.events.log_trade_events;
        async move { events::subscribers::run_logging_subscriber(&bus, log_trades, cancel).await }
    });

    // ── Reference data: metadata must load before any trade is admitted ──
    let metadata = Arc::new(metadata_cache::MetadataCache::new(cfg.metadata.clone()));
    let markets = metadata.init(api.as_ref()).await?;
    tracing::info!(markets, "metadata cache ready");
    let metadata_task = metadata.spawn_refresh(Arc::clone(&api), bus.clone());

    let ranks = Arc::new(rank_book::RankBook::new(cfg.leaderboard.clone()));
    match ranks.init_from_db(&db).await {
        Ok(n) => tracing::info!(wallets = n, "rank book restored from database"),
        Err(e) => tracing::warn!(error = %e, "failed to restore rank book"),
    }
    match ranks.refresh(api.as_ref(), &db).await {
        Ok(n) => tracing::info!(wallets = n, "rank book refreshed"),
        Err(e) => tracing::warn!(error = %e, "initial leaderboard refresh failed; using stored ranks"),
    }
    let ranks_task = ranks.spawn_refresh(Arc::clone(&api), db.clone(), bus.clone());

    let profiles = Arc::new(profiles::ProfileCache::new(&cfg.profiles));

    // ── Aggregation: scheduler ticks plus fast-path wakeups ──
    let (aggregation_tx, aggregation_rx) = tokio::sync::mpsc::channel::<()>(1);
    let aggregation = aggregation::AggregationJob::new(
        db.clone(),
        bus.clone(),
        Arc::clone(&ranks),
        Arc::clone(&metadata),
        cfg.signals.clone(),
    );
    let aggregation_task = tokio::spawn({
        let fast_path = bus.subscribe_fast_path();
        let cancel = cancel.clone();
        aggregation.run(aggregation_rx, fast_path, cancel)
    });

    let scheduler_handles = scheduler::start(
        vec![scheduler::JobSpec {
            name: "aggregation".to_string(),
            interval: Duration::from_secs(cfg.signals.refresh_interval_secs),
            tick: aggregation_tx,
            run_immediately: true,
        }],
        cancel.clone(),
    );

    // ── Feed → worker ──
    let feed = feed::spawn(cfg.feed.clone(), bus.clone(), cancel.clone());
    let worker = worker::EnrichmentWorker::new(
        worker::WorkerDeps {
            db: db.clone(),
            bus: bus.clone(),
            metadata: Arc::clone(&metadata),
            ranks: Arc::clone(&ranks),
            profiles,
            profile_source: Arc::clone(&api),
            book_source: Arc::clone(&api),
        },
        &cfg,
    );
    let worker_task = tokio::spawn(worker.run(feed.trades, cancel.clone()));
    let connection_task = tokio::spawn(feed::track_connection(feed.connected, cancel.clone()));

    tracing::info!("pipeline running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    cancel.cancel();
    metadata.shutdown();
    ranks.shutdown();

    let drain = async {
        let _ = feed.task.await;
        let _ = worker_task.await;
        let _ = connection_task.await;
        let _ = aggregation_task.await;
        for h in scheduler_handles {
            let _ = h.await;
        }
        let _ = metadata_task.await;
        let _ = ranks_task.await;
        let _ = logging_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        tracing::warn!("shutdown drain timed out");
    }

    Ok(())
}
