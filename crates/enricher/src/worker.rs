//! Two-phase trade enrichment.
//!
//! Phase one runs inline on the feed loop: filter, classify, persist as
//! `pending`, publish a preview. Phase two runs as a spawned task: resolve the
//! wallet, look up its profile and the order book concurrently, persist the
//! result and publish the enriched event. A trade whose wallet cannot be
//! resolved ends as `failed`.

use crate::classifier::{self, TagFlags, TradeClassifier, WhaleTier};
use crate::event_bus::EventBus;
use crate::events::{MarketView, PipelineEvent, TradeEvent, TradePhase, TradeView, WalletView};
use crate::feed::FeedTrade;
use crate::market_impact::{self, MarketImpact};
use crate::metadata_cache::{AssetContext, MetadataCache};
use crate::profiles::{self, DeriveOptions, ProfileCache, WalletProfile};
use crate::rank_book::RankBook;
use crate::sources::{self, OrderBookSource, ProfileSource, SourceError, TraderProfile};
use crate::store::{self, EnrichmentOutcome, TradeRecord};
use anyhow::Result;
use chrono::Utc;
use common::config;
use common::db::AsyncDb;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    BelowMinValue,
    ResolvedPrice,
    UnknownAsset,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BelowMinValue => "below_min_value",
            Self::ResolvedPrice => "resolved_price",
            Self::UnknownAsset => "unknown_asset",
        }
    }
}

/// A trade that passed the fast path and awaits enrichment.
#[derive(Debug, Clone)]
pub struct PendingTrade {
    pub trade_id: i64,
    pub trade: FeedTrade,
    pub trade_key: String,
    pub context: AssetContext,
    pub tier: Option<WhaleTier>,
    /// Feed-provided wallet, when it was a well-formed address.
    pub wallet: Option<String>,
}

#[derive(Debug)]
pub enum Admission {
    Filtered(FilterReason),
    Duplicate,
    Accepted(Box<PendingTrade>),
}

#[derive(Debug)]
pub enum EnrichmentResult {
    Enriched(Box<TradeEvent>),
    Failed(String),
}

/// Outcome counts for one [`EnrichmentWorker::run`], logged when it stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunTally {
    pub accepted: u64,
    pub duplicate: u64,
    pub filtered: BTreeMap<&'static str, u64>,
    pub enriched: u64,
    pub failed: u64,
}

impl RunTally {
    fn admitted(&mut self, admission: &Admission) {
        match admission {
            Admission::Accepted(_) => self.accepted += 1,
            Admission::Duplicate => self.duplicate += 1,
            Admission::Filtered(reason) => *self.filtered.entry(reason.as_str()).or_default() += 1,
        }
    }

    fn finished(&mut self, joined: std::result::Result<EnrichmentResult, JoinError>) {
        match joined {
            Ok(EnrichmentResult::Enriched(event)) => {
                self.enriched += 1;
                tracing::debug!(trade_id = event.trade.trade_id, tags = ?event.tags, "trade enriched");
            }
            Ok(EnrichmentResult::Failed(reason)) => {
                self.failed += 1;
                tracing::debug!(%reason, "trade enrichment failed");
            }
            Err(e) => {
                self.failed += 1;
                tracing::error!(error = %e, "enrichment task aborted");
            }
        }
    }
}

/// `0x` followed by 40 hex digits.
pub fn is_valid_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s.as_bytes()[2..].iter().all(u8::is_ascii_hexdigit)
}

pub struct WorkerDeps<P, B> {
    pub db: AsyncDb,
    pub bus: EventBus,
    pub metadata: Arc<MetadataCache>,
    pub ranks: Arc<RankBook>,
    pub profiles: Arc<ProfileCache>,
    pub profile_source: Arc<P>,
    pub book_source: Arc<B>,
}

struct Settings {
    classifier: TradeClassifier,
    whale_threshold: f64,
    filters: config::Filters,
    profile_timeout: Duration,
    order_book_timeout: Duration,
    max_sweep_levels: usize,
    fresh_wallet_max_tx: u64,
}

pub struct EnrichmentWorker<P, B> {
    deps: Arc<WorkerDeps<P, B>>,
    settings: Arc<Settings>,
}

impl<P, B> Clone for EnrichmentWorker<P, B> {
    fn clone(&self) -> Self {
        Self {
            deps: Arc::clone(&self.deps),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<P, B> EnrichmentWorker<P, B>
where
    P: ProfileSource + Send + Sync + 'static,
    B: OrderBookSource + Send + Sync + 'static,
{
    pub fn new(deps: WorkerDeps<P, B>, cfg: &config::Config) -> Self {
        Self {
            deps: Arc::new(deps),
            settings: Arc::new(Settings {
                classifier: TradeClassifier::new(cfg.classifier.clone()),
                whale_threshold: cfg.classifier.whale,
                filters: cfg.filters.clone(),
                profile_timeout: Duration::from_millis(cfg.enrichment.profile_timeout_ms),
                order_book_timeout: Duration::from_millis(cfg.enrichment.order_book_timeout_ms),
                max_sweep_levels: cfg.enrichment.max_sweep_levels,
                fresh_wallet_max_tx: cfg.profiles.fresh_wallet_max_tx,
            }),
        }
    }

    fn filter(&self, trade: &FeedTrade) -> Result<AssetContext, FilterReason> {
        let f = &self.settings.filters;
        if trade.value() < f.min_trade_value {
            return Err(FilterReason::BelowMinValue);
        }
        if trade.price > f.resolved_price_threshold {
            return Err(FilterReason::ResolvedPrice);
        }
        self.deps
            .metadata
            .lookup(&trade.asset_id)
            .ok_or(FilterReason::UnknownAsset)
    }

    /// Fast path. Persistence errors propagate to the caller; everything else
    /// is an [`Admission`].
    pub async fn admit(&self, trade: FeedTrade) -> Result<Admission> {
        let context = match self.filter(&trade) {
            Ok(ctx) => ctx,
            Err(reason) => {
                metrics::counter!("enricher_trades_filtered_total", "reason" => reason.as_str())
                    .increment(1);
                tracing::debug!(asset_id = %trade.asset_id, value = trade.value(), reason = reason.as_str(), "trade filtered");
                return Ok(Admission::Filtered(reason));
            }
        };

        let value = trade.value();
        let tier = self.settings.classifier.classify(value);
        let tags = classifier::build_analysis_tags(tier, &TagFlags::default());
        let wallet = trade
            .proxy_wallet
            .clone()
            .filter(|w| is_valid_address(w));
        let trade_key = trade.trade_key();

        let record = TradeRecord {
            trade_key: trade_key.clone(),
            asset_id: trade.asset_id.clone(),
            condition_id: context.outcome.condition_id.clone(),
            outcome: context.outcome.outcome.clone(),
            outcome_index: Some(context.outcome.outcome_index as i64),
            side: trade.side,
            price: trade.price,
            size: trade.size,
            value,
            wallet: wallet.clone(),
            timestamp: trade.timestamp,
            transaction_hash: trade.transaction_hash.clone(),
            whale_tier: tier,
            tags: tags.clone(),
        };
        let Some(trade_id) = store::insert_pending_trade(&self.deps.db, record).await? else {
            metrics::counter!("enricher_trades_duplicate_total").increment(1);
            tracing::debug!(%trade_key, "duplicate trade ignored");
            return Ok(Admission::Duplicate);
        };
        metrics::counter!(
            "enricher_trades_accepted_total",
            "tier" => tier.map_or("NONE", |t| t.as_str())
        )
        .increment(1);

        let pending = PendingTrade {
            trade_id,
            trade,
            trade_key,
            context,
            tier,
            wallet,
        };
        let preview = trade_event(
            TradePhase::Preview,
            &pending,
            WalletView::unresolved(pending.wallet.clone()),
            tags,
            None,
        );
        self.deps.bus.publish_pipeline(PipelineEvent::TradePreview {
            trade: Box::new(preview),
        });
        Ok(Admission::Accepted(Box::new(pending)))
    }

    async fn resolve_wallet(&self, pending: &PendingTrade) -> Result<String> {
        if let Some(w) = &pending.wallet {
            return Ok(w.clone());
        }
        let tx_hash = pending
            .trade
            .transaction_hash
            .clone()
            .unwrap_or_default();
        if tx_hash.is_empty() {
            return Err(SourceError::UnresolvedWallet { tx_hash }.into());
        }
        let found = sources::with_timeout(
            "resolve_wallet",
            self.settings.profile_timeout,
            self.deps.profile_source.resolve_wallet(
                &pending.context.outcome.condition_id,
                &pending.trade.asset_id,
                &tx_hash,
            ),
        )
        .await?;
        match found.filter(|w| is_valid_address(w)) {
            Some(w) => Ok(w),
            None => Err(SourceError::UnresolvedWallet { tx_hash }.into()),
        }
    }

    async fn lookup_profile(&self, wallet: &str) -> Option<TraderProfile> {
        let res = sources::with_timeout(
            "profile",
            self.settings.profile_timeout,
            self.deps
                .profiles
                .get(self.deps.profile_source.as_ref(), wallet),
        )
        .await;
        match res {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(%wallet, error = %e, "profile lookup failed; using defaults");
                None
            }
        }
    }

    async fn lookup_impact(&self, pending: &PendingTrade) -> Option<MarketImpact> {
        let res = sources::with_timeout(
            "order_book",
            self.settings.order_book_timeout,
            self.deps
                .book_source
                .fetch_order_book(&pending.trade.asset_id),
        )
        .await;
        match res {
            Ok(book) => market_impact::analyze(
                &book,
                pending.trade.side,
                pending.trade.value(),
                self.settings.max_sweep_levels,
            ),
            Err(e) => {
                tracing::warn!(asset_id = %pending.trade.asset_id, error = %e, "order book lookup failed");
                None
            }
        }
    }

    /// Slow path. Never returns an error: failures end in
    /// [`EnrichmentResult::Failed`] with the trade marked terminally.
    pub async fn enrich(&self, pending: PendingTrade) -> EnrichmentResult {
        let start = Instant::now();
        let (wallet_and_profile, impact) = tokio::join!(
            async {
                let wallet = self.resolve_wallet(&pending).await?;
                let profile = self.lookup_profile(&wallet).await;
                Ok::<_, anyhow::Error>((wallet, profile))
            },
            self.lookup_impact(&pending),
        );

        let res = match wallet_and_profile {
            Ok((wallet, trader)) => self.finish(&pending, wallet, trader, impact).await,
            Err(e) => Err(e),
        };
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("enricher_enrichment_latency_ms").record(elapsed_ms);

        match res {
            Ok(event) => {
                metrics::counter!("enricher_trades_enriched_total").increment(1);
                self.deps.bus.publish_pipeline(PipelineEvent::TradeEnriched {
                    trade: Box::new(event.clone()),
                });
                self.deps.bus.trigger_fast_path();
                EnrichmentResult::Enriched(Box::new(event))
            }
            Err(e) => {
                let reason = e.to_string();
                metrics::counter!("enricher_trades_failed_total").increment(1);
                tracing::warn!(trade_id = pending.trade_id, trade_key = %pending.trade_key, error = %reason, "enrichment failed");
                if let Err(db_err) = store::mark_failed(&self.deps.db, pending.trade_id).await {
                    tracing::error!(trade_id = pending.trade_id, error = %db_err, "could not mark trade failed");
                }
                self.deps.bus.publish_pipeline(PipelineEvent::TradeFailed {
                    trade_id: pending.trade_id,
                    trade_key: pending.trade_key.clone(),
                    reason: reason.clone(),
                    failed_at: Utc::now(),
                });
                EnrichmentResult::Failed(reason)
            }
        }
    }

    async fn finish(
        &self,
        pending: &PendingTrade,
        wallet: String,
        trader: Option<TraderProfile>,
        impact: Option<MarketImpact>,
    ) -> Result<TradeEvent> {
        let counters = store::attribute_wallet(&self.deps.db, pending.trade_id, wallet.clone()).await?;
        let best_rank = self.deps.ranks.best_rank(&wallet);
        let whale_trade = pending.tier.is_some_and(|t| t.is_whale())
            || counters.max_trade_value >= self.settings.whale_threshold;
        let profile = profiles::derive_wallet_profile(
            &wallet,
            counters,
            trader.as_ref(),
            DeriveOptions {
                fresh_wallet_max_tx: self.settings.fresh_wallet_max_tx,
                best_rank,
                whale_trade,
            },
        );

        let flags = TagFlags {
            smart_money: profile.is_smart_money,
            fresh_wallet: profile.is_fresh,
            sweeper: impact.is_some_and(|i| i.is_sweeper),
            insider: classifier::is_insider(profile.activity_level, profile.win_rate, profile.total_pnl),
            top_trader: best_rank.and_then(crate::tiers::tier_of).is_some(),
            extra: Vec::new(),
        };
        let tags = classifier::build_analysis_tags(pending.tier, &flags);

        store::finish_enrichment(
            &self.deps.db,
            EnrichmentOutcome {
                trade_id: pending.trade_id,
                profile: Some(profile.clone()),
                tags: tags.clone(),
                impact,
            },
        )
        .await?;

        Ok(trade_event(
            TradePhase::Enriched,
            pending,
            wallet_view(&profile, best_rank),
            tags,
            impact,
        ))
    }

    /// Drain the feed until it closes or `cancel` fires, then wait for
    /// in-flight enrichments.
    pub async fn run(self, mut trades: mpsc::Receiver<FeedTrade>, cancel: CancellationToken) -> RunTally {
        let mut tally = RunTally::default();
        let mut in_flight: JoinSet<EnrichmentResult> = JoinSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => tally.finished(joined),
                maybe = trades.recv() => {
                    let Some(trade) = maybe else { break };
                    match self.admit(trade).await {
                        Ok(admission) => {
                            tally.admitted(&admission);
                            if let Admission::Accepted(pending) = admission {
                                let worker = self.clone();
                                in_flight.spawn(async move { worker.enrich(*pending).await });
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to persist trade; continuing");
                        }
                    }
                    metrics::gauge!("enricher_enrichments_in_flight").set(in_flight.len() as f64);
                }
            }
        }
        let remaining = in_flight.len();
        while let Some(joined) = in_flight.join_next().await {
            tally.finished(joined);
        }
        metrics::gauge!("enricher_enrichments_in_flight").set(0.0);
        tracing::info!(
            drained = remaining,
            accepted = tally.accepted,
            duplicate = tally.duplicate,
            filtered = ?tally.filtered,
            enriched = tally.enriched,
            failed = tally.failed,
            "enrichment worker stopped"
        );
        tally
    }
}

fn wallet_view(profile: &WalletProfile, best_rank: Option<i64>) -> WalletView {
    WalletView {
        address: Some(profile.address.clone()),
        best_rank,
        total_pnl: profile.total_pnl,
        win_rate: profile.win_rate,
        tx_count: profile.effective_tx_count(),
        activity_level: profile.activity_level,
        is_fresh: profile.is_fresh,
        is_smart_money: profile.is_smart_money,
    }
}

fn trade_event(
    phase: TradePhase,
    pending: &PendingTrade,
    wallet: WalletView,
    tags: Vec<String>,
    impact: Option<MarketImpact>,
) -> TradeEvent {
    let market = &pending.context.market;
    TradeEvent {
        phase,
        trade: TradeView {
            trade_id: pending.trade_id,
            trade_key: pending.trade_key.clone(),
            asset_id: pending.trade.asset_id.clone(),
            condition_id: pending.context.outcome.condition_id.clone(),
            outcome: pending.context.outcome.outcome.clone(),
            side: pending.trade.side,
            price: pending.trade.price,
            size: pending.trade.size,
            value: pending.trade.value(),
            timestamp: pending.trade.timestamp,
            transaction_hash: pending.trade.transaction_hash.clone(),
        },
        market: MarketView {
            question: market.question.clone(),
            slug: market.slug.clone(),
            event_slug: market.event_slug.clone(),
            category: market.category.clone(),
            liquidity: market.liquidity,
            volume_24h: market.volume_24h,
        },
        wallet,
        whale_tier: pending.tier,
        tags,
        impact,
        emitted_at: Utc::now(),
    }
}
