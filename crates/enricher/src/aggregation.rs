//! Periodic signal aggregation.
//!
//! For each configured window, persisted trades are grouped by market and
//! outcome, scored with the composite calculator and ranked by percentile
//! across the active set. Each run persists one snapshot per group. Snapshots
//! from scheduled runs become the baseline history for later runs; fast-path
//! runs only refresh the live view.

use crate::composite::{self, CompositeSignalInput, MarketBaseline};
use crate::event_bus::EventBus;
use crate::events::{FastPathTrigger, OperationalEvent, PipelineEvent, RankedSignal};
use crate::metadata_cache::MetadataCache;
use crate::rank_book::{RankBook, WalletRank};
use crate::stats;
use crate::store::{self, SignalSnapshotRow, SnapshotKind, SnapshotRetention, WindowTrade};
use crate::tiers;
use anyhow::Result;
use chrono::Utc;
use common::config;
use common::db::AsyncDb;
use common::types::Side;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const JOB_NAME: &str = "signal_aggregation";

/// Assemble the calculator input for one market/outcome. The baseline is
/// left at its default; see [`baseline_for`].
pub fn build_input(
    trades: &[WindowTrade],
    ranks: &HashMap<String, WalletRank>,
    now: i64,
    decay_lambda: f64,
) -> CompositeSignalInput {
    let mut input = CompositeSignalInput::default();
    let mut buyers: HashMap<&str, i64> = HashMap::new();
    let mut sellers: HashMap<&str, i64> = HashMap::new();

    for t in trades {
        input.total_volume += t.value;
        match t.side {
            Side::Buy => input.buy_volume += t.value,
            Side::Sell => input.sell_volume += t.value,
        }
        let Some(wallet) = t.wallet.as_deref() else {
            continue;
        };
        *input.wallet_volumes.entry(wallet.to_string()).or_default() += t.value;

        let Some(rank) = ranks.get(wallet).map(|r| r.rank) else {
            continue;
        };
        if tiers::tier_of(rank).is_none() {
            continue;
        }
        input.wallet_ranks.insert(wallet.to_string(), rank);
        input.top_tier_volume += t.value;
        input.decayed_top_tier_volume += t.value * stats::time_decay_weight(t.timestamp, now, decay_lambda);
        match t.side {
            Side::Buy => {
                input.top_trader_buy_volume += t.value;
                buyers.insert(wallet, rank);
            }
            Side::Sell => {
                input.top_trader_sell_volume += t.value;
                sellers.insert(wallet, rank);
            }
        }
    }

    input.top_trader_buy_count = buyers.len() as u32;
    input.top_trader_sell_count = sellers.len() as u32;
    let buy_ranks: Vec<i64> = buyers.into_values().collect();
    let sell_ranks: Vec<i64> = sellers.into_values().collect();
    input.weighted_counts = Some(composite::weighted_counts_from_ranks(&buy_ranks, &sell_ranks));
    input
}

/// Baseline from snapshot history. Without history the current values stand
/// in as the single sample, which puts the z-score at zero.
pub fn baseline_for(history: Option<&Vec<(f64, f64)>>, total: f64, top_tier: f64) -> MarketBaseline {
    match history.filter(|h| !h.is_empty()) {
        Some(h) => {
            let totals: Vec<f64> = h.iter().map(|(t, _)| *t).collect();
            let tops: Vec<f64> = h.iter().map(|(_, t)| *t).collect();
            MarketBaseline::from_samples(&totals, &tops)
        }
        None => MarketBaseline::from_samples(&[total], &[top_tier]),
    }
}

pub struct AggregationJob {
    db: AsyncDb,
    bus: EventBus,
    ranks: Arc<RankBook>,
    metadata: Arc<MetadataCache>,
    cfg: config::Signals,
}

impl AggregationJob {
    pub fn new(
        db: AsyncDb,
        bus: EventBus,
        ranks: Arc<RankBook>,
        metadata: Arc<MetadataCache>,
        cfg: config::Signals,
    ) -> Self {
        Self {
            db,
            bus,
            ranks,
            metadata,
            cfg,
        }
    }

    fn retention(&self, now: i64) -> SnapshotRetention {
        SnapshotRetention {
            samples_per_key: self.cfg.baseline_samples,
            retain_since: now - i64::from(self.cfg.retention_hours) * 3600,
        }
    }

    /// Score one window and return its signals, best first.
    pub async fn run_window(&self, window_hours: u32, now: i64, kind: SnapshotKind) -> Result<Vec<RankedSignal>> {
        let since = now - i64::from(window_hours) * 3600;
        let trades = store::load_window_trades(&self.db, since).await?;
        let mut groups: BTreeMap<(String, String), Vec<WindowTrade>> = BTreeMap::new();
        for t in trades {
            groups
                .entry((t.condition_id.clone(), t.outcome.clone()))
                .or_default()
                .push(t);
        }
        if groups.is_empty() {
            tracing::debug!(window_hours, "no trades in window");
            return Ok(Vec::new());
        }

        let history = store::load_baseline_samples(&self.db, window_hours, self.cfg.baseline_samples).await?;
        let ranks = self.ranks.snapshot();

        let mut keys = Vec::with_capacity(groups.len());
        let mut totals = Vec::with_capacity(groups.len());
        let mut scored = Vec::with_capacity(groups.len());
        for (key, group) in &groups {
            let mut input = build_input(group, &ranks, now, self.cfg.decay_lambda);
            input.baseline = baseline_for(history.get(key), input.total_volume, input.top_tier_volume);
            scored.push(composite::calculate(&input));
            totals.push((input.total_volume, input.top_tier_volume));
            keys.push(key.clone());
        }
        composite::apply_percentiles(&mut scored);

        let meta = self.metadata.snapshot();
        let mut signals = Vec::with_capacity(keys.len());
        let mut rows = Vec::with_capacity(keys.len());
        for (((condition_id, outcome), (total_volume, top_tier_volume)), m) in
            keys.into_iter().zip(totals).zip(scored)
        {
            signals.push(RankedSignal {
                condition_id: condition_id.clone(),
                outcome: outcome.clone(),
                question: meta.market(&condition_id).map(|mm| mm.question.clone()),
                dominant_side: m.dominant_side,
                total_volume,
                raw_confidence: m.raw_confidence,
                percentile: m.percentile,
                signal_quality: m.signal_quality,
            });
            rows.push(SignalSnapshotRow {
                condition_id,
                outcome,
                window_hours,
                total_volume,
                top_tier_volume,
                metrics: m,
                computed_at: now,
            });
        }
        store::insert_signal_snapshots(&self.db, window_hours, kind, rows, self.retention(now)).await?;

        signals.sort_by(|a, b| b.raw_confidence.total_cmp(&a.raw_confidence));
        metrics::gauge!("enricher_active_signals", "window_hours" => window_hours.to_string())
            .set(signals.len() as f64);
        Ok(signals)
    }

    /// Every configured window. A failing window is logged and skipped.
    pub async fn run_once(&self, now: i64, kind: SnapshotKind) -> Result<usize> {
        let mut published = 0;
        let mut last_err = None;
        for &window_hours in &self.cfg.windows_hours {
            match self.run_window(window_hours, now, kind).await {
                Ok(signals) if signals.is_empty() => {}
                Ok(signals) => {
                    published += signals.len();
                    self.bus.publish_pipeline(PipelineEvent::SignalsRanked {
                        window_hours,
                        signals,
                        computed_at: Utc::now(),
                    });
                }
                Err(e) => {
                    tracing::warn!(window_hours, error = %e, "signal aggregation failed for window");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if published == 0 => Err(e),
            _ => Ok(published),
        }
    }

    async fn run_reported(&self, kind: SnapshotKind) {
        let start = std::time::Instant::now();
        self.bus.publish_operational(OperationalEvent::JobStarted {
            job_name: JOB_NAME.to_string(),
            started_at: Utc::now(),
        });
        match self.run_once(Utc::now().timestamp(), kind).await {
            Ok(n) => {
                metrics::counter!("enricher_aggregation_runs_total", "status" => "ok").increment(1);
                self.bus.publish_operational(OperationalEvent::JobCompleted {
                    job_name: JOB_NAME.to_string(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    completed_at: Utc::now(),
                });
                tracing::debug!(signals = n, "aggregation run complete");
            }
            Err(e) => {
                metrics::counter!("enricher_aggregation_runs_total", "status" => "error").increment(1);
                self.bus.publish_operational(OperationalEvent::JobFailed {
                    job_name: JOB_NAME.to_string(),
                    error: e.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
    }

    /// Run on every scheduler tick and every fast-path generation bump. Only
    /// ticks add baseline samples.
    pub async fn run(
        self,
        mut tick: mpsc::Receiver<()>,
        mut fast_path: watch::Receiver<FastPathTrigger>,
        cancel: CancellationToken,
    ) {
        let mut fast_path_open = true;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                maybe = tick.recv() => {
                    if maybe.is_none() {
                        break;
                    }
                    self.run_reported(SnapshotKind::Sample).await;
                }
                changed = fast_path.changed(), if fast_path_open => {
                    if changed.is_err() {
                        fast_path_open = false;
                        continue;
                    }
                    self.run_reported(SnapshotKind::Live).await;
                }
            }
        }
        tracing::info!("aggregation job stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fakes::{entry, market, FakeLeaderboard, FakeMetadata};
    use crate::store::TradeRecord;

    const NOW: i64 = 1_700_000_000;

    fn trade(wallet: Option<&str>, side: Side, value: f64, ts: i64) -> WindowTrade {
        WindowTrade {
            condition_id: "0xc1".to_string(),
            outcome: "Yes".to_string(),
            wallet: wallet.map(str::to_string),
            side,
            value,
            timestamp: ts,
        }
    }

    fn rank(r: i64) -> WalletRank {
        WalletRank {
            rank: r,
            time_period: "ALL".to_string(),
            pnl: None,
            user_name: None,
        }
    }

    #[test]
    fn test_build_input_splits_ranked_and_unranked() {
        let ranks = HashMap::from([("0xe".to_string(), rank(3)), ("0xfar".to_string(), rank(500))]);
        let trades = vec![
            trade(Some("0xe"), Side::Buy, 10_000.0, NOW),
            trade(Some("0xe"), Side::Buy, 5_000.0, NOW - 36_000),
            trade(Some("0xfar"), Side::Sell, 4_000.0, NOW),
            trade(None, Side::Sell, 1_000.0, NOW),
        ];
        let input = build_input(&trades, &ranks, NOW, 0.1);

        assert_eq!(input.total_volume, 20_000.0);
        assert_eq!(input.buy_volume, 15_000.0);
        assert_eq!(input.sell_volume, 5_000.0);
        assert_eq!(input.top_tier_volume, 15_000.0);
        assert_eq!(input.top_trader_buy_count, 1);
        assert_eq!(input.top_trader_sell_count, 0);
        assert_eq!(input.wallet_ranks.len(), 1);
        assert_eq!(input.wallet_volumes.len(), 2);
        // 10h old trade decays to e^-1.
        let expected = 10_000.0 + 5_000.0 * (-1.0f64).exp();
        assert!((input.decayed_top_tier_volume - expected).abs() < 1e-6);
        let counts = input.weighted_counts.unwrap();
        assert_eq!(counts.buy, 1.0);
        assert_eq!(counts.sell, 0.0);
    }

    #[test]
    fn test_baseline_without_history_is_neutral() {
        let b = baseline_for(None, 40_000.0, 10_000.0);
        assert_eq!(b.mean_top_tier_volume, 10_000.0);
        assert_eq!(b.stddev_top_tier_volume, 5_000.0);
        assert_eq!(stats::z_score(10_000.0, b.mean_top_tier_volume, b.stddev_top_tier_volume), 0.0);

        let history = vec![(1_000.0, 100.0), (3_000.0, 300.0)];
        let b = baseline_for(Some(&history), 40_000.0, 10_000.0);
        assert_eq!(b.sample_count, 2);
        assert_eq!(b.mean_top_tier_volume, 200.0);
    }

    async fn job() -> (AggregationJob, AsyncDb, EventBus) {
        let cfg = config::Config::from_toml_str(include_str!("../../../config/default.toml")).unwrap();
        let db = AsyncDb::open(":memory:").await.unwrap();
        let bus = EventBus::new(32);

        let metadata = Arc::new(MetadataCache::new(cfg.metadata.clone()));
        metadata
            .init(&FakeMetadata::with(vec![market("0xc1", &["111", "222"], &["Yes", "No"])]))
            .await
            .unwrap();
        let mut board = FakeLeaderboard::default();
        board.boards.insert("ALL".to_string(), vec![entry(1, "0xelite", 1.0)]);
        let ranks = Arc::new(RankBook::new(cfg.leaderboard.clone()));
        ranks.refresh(&board, &db).await.unwrap();

        let job = AggregationJob::new(db.clone(), bus.clone(), ranks, metadata, cfg.signals);
        (job, db, bus)
    }

    async fn insert(db: &AsyncDb, key: &str, outcome: &str, wallet: &str, value: f64) {
        store::insert_pending_trade(
            db,
            TradeRecord {
                trade_key: key.to_string(),
                asset_id: if outcome == "Yes" { "111" } else { "222" }.to_string(),
                condition_id: "0xc1".to_string(),
                outcome: outcome.to_string(),
                outcome_index: None,
                side: Side::Buy,
                price: 0.5,
                size: value * 2.0,
                value,
                wallet: Some(wallet.to_string()),
                timestamp: NOW - 60,
                transaction_hash: None,
                whale_tier: None,
                tags: vec![],
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_ranks_and_persists() {
        let (job, db, bus) = job().await;
        let mut events = bus.subscribe_pipeline();
        insert(&db, "k1", "Yes", "0xelite", 50_000.0).await;
        insert(&db, "k2", "No", "0xnobody", 20_000.0).await;

        // Two groups in each of the 1h and 24h windows.
        assert_eq!(job.run_once(NOW, SnapshotKind::Sample).await.unwrap(), 4);

        let PipelineEvent::SignalsRanked { window_hours, signals, .. } = events.recv().await.unwrap() else {
            panic!("expected ranked signals");
        };
        assert_eq!(window_hours, 1);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].outcome, "Yes");
        assert_eq!(signals[0].percentile, 75);
        assert_eq!(signals[1].percentile, 25);
        assert!(signals[0].raw_confidence > signals[1].raw_confidence);
        assert_eq!(signals[0].question.as_deref(), Some("Question for 0xc1?"));

        // The first run becomes history for the next.
        job.run_once(NOW + 1, SnapshotKind::Sample).await.unwrap();
        let history = store::load_baseline_samples(&db, 1, 48).await.unwrap();
        assert_eq!(history[&("0xc1".to_string(), "Yes".to_string())].len(), 2);
        let latest = store::latest_signals(&db, 24, 10).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().all(|r| r.computed_at == NOW + 1));
    }

    #[tokio::test]
    async fn test_empty_window_publishes_nothing() {
        let (job, _db, bus) = job().await;
        let mut events = bus.subscribe_pipeline();
        assert_eq!(job.run_once(NOW, SnapshotKind::Sample).await.unwrap(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fast_path_trigger_runs_job() {
        let (job, _db, bus) = job().await;
        let mut ops = bus.subscribe_operational();
        let (_tick_tx, tick_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(job.run(tick_rx, bus.subscribe_fast_path(), cancel.clone()));

        bus.trigger_fast_path();
        assert!(matches!(ops.recv().await.unwrap(), OperationalEvent::JobStarted { .. }));
        assert!(matches!(ops.recv().await.unwrap(), OperationalEvent::JobCompleted { .. }));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_small_change_after_flat_history_is_not_unusual() {
        let (job, db, _bus) = job().await;
        insert(&db, "k1", "Yes", "0xelite", 50_000.0).await;
        for i in 0..3 {
            job.run_window(1, NOW + i * 300, SnapshotKind::Sample).await.unwrap();
        }

        // +2% on top of three identical samples.
        insert(&db, "k2", "Yes", "0xelite", 1_000.0).await;
        job.run_window(1, NOW + 900, SnapshotKind::Sample).await.unwrap();

        let latest = store::latest_signals(&db, 1, 10).await.unwrap();
        assert_eq!(latest.len(), 1);
        let m = &latest[0].metrics;
        assert!(m.z_score < 0.1, "z = {}", m.z_score);
        assert!(!m.is_unusual_activity);
        assert!(m.volume_component < 0.5);
        assert!(m.raw_confidence < 1.0);
    }

    #[tokio::test]
    async fn test_fast_path_runs_do_not_add_baseline_samples() {
        let (job, db, _bus) = job().await;
        insert(&db, "k1", "Yes", "0xelite", 50_000.0).await;
        job.run_window(1, NOW, SnapshotKind::Sample).await.unwrap();
        for i in 1..=5 {
            job.run_window(1, NOW + i, SnapshotKind::Live).await.unwrap();
        }

        let history = store::load_baseline_samples(&db, 1, 48).await.unwrap();
        assert_eq!(history[&("0xc1".to_string(), "Yes".to_string())].len(), 1);
        let latest = store::latest_signals(&db, 1, 10).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].computed_at, NOW + 5);
    }
}
