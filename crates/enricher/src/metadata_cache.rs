//! Market metadata snapshot.
//!
//! The whole snapshot is rebuilt on every refresh and swapped in one write, so
//! readers never observe a half-built state. A lookup clones the snapshot `Arc`
//! once and answers from that copy even if a refresh lands meanwhile.

use crate::bounded_map::BoundedMap;
use crate::event_bus::EventBus;
use crate::events::PipelineEvent;
use crate::sources::MetadataSource;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use common::config;
use common::types::GammaMarket;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketMeta {
    pub condition_id: String,
    pub question: String,
    pub slug: Option<String>,
    pub event_slug: Option<String>,
    pub outcomes: Vec<String>,
    pub asset_ids: Vec<String>,
    pub category: Option<String>,
    pub sport: Option<String>,
    pub league: Option<String>,
    pub liquidity: f64,
    pub volume_24h: f64,
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub resolution_ts: Option<i64>,
}

/// Which market and outcome an asset (CLOB token) belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRef {
    pub condition_id: String,
    pub outcome: String,
    pub outcome_index: usize,
}

/// Result of resolving an asset id against one snapshot.
#[derive(Debug, Clone)]
pub struct AssetContext {
    pub market: Arc<MarketMeta>,
    pub outcome: OutcomeRef,
}

fn parse_ts(raw: Option<&str>) -> Option<i64> {
    let raw = raw?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

impl MarketMeta {
    pub fn from_gamma(m: &GammaMarket) -> Option<Self> {
        let condition_id = m.condition_id.as_deref().filter(|s| !s.is_empty())?;
        Some(Self {
            condition_id: condition_id.to_string(),
            question: m.question.clone().unwrap_or_default(),
            slug: m.slug.clone(),
            event_slug: m.event_slug().map(str::to_string),
            outcomes: m.outcome_labels(),
            asset_ids: m.token_ids(),
            category: m.category.clone(),
            sport: m.sport.clone(),
            league: m.league.clone(),
            liquidity: m.liquidity.unwrap_or(0.0),
            volume_24h: m.volume_24h.unwrap_or(0.0),
            start_ts: parse_ts(m.start_date.as_deref()),
            end_ts: parse_ts(m.end_date.as_deref()),
            resolution_ts: parse_ts(m.resolution_date.as_deref()),
        })
    }
}

#[derive(Debug)]
pub struct MetadataSnapshot {
    markets: BoundedMap<String, Arc<MarketMeta>>,
    assets: BoundedMap<String, OutcomeRef>,
    loaded_at: Option<DateTime<Utc>>,
}

impl MetadataSnapshot {
    pub fn empty(max_markets: usize, max_assets: usize) -> Self {
        Self {
            markets: BoundedMap::new(max_markets),
            assets: BoundedMap::new(max_assets),
            loaded_at: None,
        }
    }

    pub fn build(raw: &[GammaMarket], max_markets: usize, max_assets: usize) -> Self {
        let mut snap = Self::empty(max_markets, max_assets);
        for meta in raw.iter().filter_map(MarketMeta::from_gamma) {
            let meta = Arc::new(meta);
            for (idx, asset) in meta.asset_ids.iter().enumerate() {
                let outcome = meta
                    .outcomes
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| format!("outcome_{idx}"));
                snap.assets.insert(
                    asset.clone(),
                    OutcomeRef {
                        condition_id: meta.condition_id.clone(),
                        outcome,
                        outcome_index: idx,
                    },
                );
            }
            snap.markets.insert(meta.condition_id.clone(), meta);
        }
        snap.loaded_at = Some(Utc::now());
        snap
    }

    pub fn market(&self, condition_id: &str) -> Option<Arc<MarketMeta>> {
        self.markets.get(condition_id).cloned()
    }

    pub fn lookup_asset(&self, asset_id: &str) -> Option<AssetContext> {
        let outcome = self.assets.get(asset_id)?.clone();
        let market = self.market(&outcome.condition_id)?;
        Some(AssetContext { market, outcome })
    }

    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    /// Entries dropped while building because the source returned more than
    /// the configured capacity.
    pub fn evicted(&self) -> u64 {
        self.markets.evicted() + self.assets.evicted()
    }

    /// Seconds since the snapshot was built; `None` before the first load.
    pub fn age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.loaded_at.map(|at| (now - at).num_seconds().max(0))
    }
}

pub struct MetadataCache {
    cfg: config::Metadata,
    snapshot: RwLock<Arc<MetadataSnapshot>>,
    cancel: CancellationToken,
}

impl MetadataCache {
    pub fn new(cfg: config::Metadata) -> Self {
        let empty = MetadataSnapshot::empty(cfg.max_markets, cfg.max_assets);
        Self {
            cfg,
            snapshot: RwLock::new(Arc::new(empty)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lookup(&self, asset_id: &str) -> Option<AssetContext> {
        self.snapshot().lookup_asset(asset_id)
    }

    /// First load. Fails when the source fails so the caller can abort startup.
    pub async fn init<S: MetadataSource>(&self, source: &S) -> Result<usize> {
        self.refresh(source)
            .await
            .context("initial market metadata load failed")
    }

    /// Rebuild from the source and swap. On failure the current snapshot stays.
    pub async fn refresh<S: MetadataSource>(&self, source: &S) -> Result<usize> {
        let start = std::time::Instant::now();
        let raw = match source
            .fetch_markets(self.cfg.page_size, self.cfg.max_pages)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                metrics::counter!("enricher_metadata_refresh_total", "status" => "error")
                    .increment(1);
                return Err(e);
            }
        };

        let snap = MetadataSnapshot::build(&raw, self.cfg.max_markets, self.cfg.max_assets);
        let (markets, assets, evicted) = (snap.market_count(), snap.asset_count(), snap.evicted());
        if snap.markets.is_empty() {
            tracing::warn!("metadata refresh returned no markets");
        }
        if evicted > 0 {
            tracing::warn!(evicted, "metadata snapshot over capacity; oldest entries dropped");
        }
        let loaded_at = snap.loaded_at.map_or(0, |at| at.timestamp());
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snap);

        metrics::counter!("enricher_metadata_refresh_total", "status" => "ok").increment(1);
        metrics::gauge!("enricher_metadata_markets").set(markets as f64);
        metrics::gauge!("enricher_metadata_assets").set(assets as f64);
        metrics::gauge!("enricher_metadata_evicted").set(evicted as f64);
        metrics::gauge!("enricher_metadata_loaded_timestamp_seconds").set(loaded_at as f64);
        tracing::info!(
            markets,
            assets,
            duration_ms = start.elapsed().as_millis() as u64,
            "metadata snapshot refreshed"
        );
        Ok(markets)
    }

    /// Refresh on the configured interval until [`Self::shutdown`].
    pub fn spawn_refresh<S>(self: &Arc<Self>, source: Arc<S>, bus: EventBus) -> JoinHandle<()>
    where
        S: MetadataSource + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        let period = Duration::from_secs(this.cfg.refresh_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match this.refresh(source.as_ref()).await {
                            Ok(markets) => {
                                bus.publish_pipeline(PipelineEvent::MetadataRefreshed {
                                    markets,
                                    assets: this.snapshot().asset_count(),
                                    refreshed_at: chrono::Utc::now(),
                                });
                            }
                            Err(e) => {
                                let age_secs = this.snapshot().age_secs(Utc::now());
                                tracing::warn!(error = %e, ?age_secs, "metadata refresh failed; keeping previous snapshot");
                            }
                        }
                    }
                }
            }
            tracing::info!("metadata refresh task stopped");
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
