//! Trader profiles (cached upstream lookups) and the wallet profile derived
//! from them plus locally observed counters.

use crate::classifier;
use crate::sources::{ProfileSource, TraderProfile};
use crate::store::WalletCounters;
use anyhow::Result;
use chrono::{DateTime, Utc};
use common::config;
use common::types::ActivityLevel;
use moka::future::Cache;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletProfile {
    pub address: String,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub tx_count: u64,
    pub external_trade_count: u64,
    pub is_fresh: bool,
    pub activity_level: ActivityLevel,
    pub max_trade_value: f64,
    pub is_smart_money: bool,
    pub is_whale: bool,
    pub updated_at: DateTime<Utc>,
}

impl WalletProfile {
    /// Larger of the observed and upstream-reported trade counts.
    pub fn effective_tx_count(&self) -> u64 {
        self.tx_count.max(self.external_trade_count)
    }
}

/// Inputs for [`derive_wallet_profile`] beyond the stored counters.
#[derive(Debug, Clone, Copy)]
pub struct DeriveOptions {
    pub fresh_wallet_max_tx: u64,
    pub best_rank: Option<i64>,
    pub whale_trade: bool,
}

/// Combine observed counters with an optional upstream profile. A missing
/// profile degrades to zero PnL and win rate, and the wallet is not flagged as
/// a whale.
pub fn derive_wallet_profile(
    address: &str,
    counters: WalletCounters,
    trader: Option<&TraderProfile>,
    opts: DeriveOptions,
) -> WalletProfile {
    let total_pnl = trader.map_or(0.0, |t| t.total_pnl);
    let win_rate = trader.map_or(0.0, |t| t.win_rate);
    let external_trade_count = trader.map_or(0, |t| t.total_trades);
    let effective = counters.tx_count.max(external_trade_count);

    WalletProfile {
        address: address.to_lowercase(),
        total_pnl,
        win_rate,
        tx_count: counters.tx_count,
        external_trade_count,
        is_fresh: effective < opts.fresh_wallet_max_tx,
        activity_level: ActivityLevel::from_tx_count(effective),
        max_trade_value: counters.max_trade_value,
        is_smart_money: classifier::is_smart_money(opts.best_rank, total_pnl, win_rate),
        is_whale: trader.is_some() && opts.whale_trade,
        updated_at: Utc::now(),
    }
}

/// TTL cache over a [`ProfileSource`]. Failed lookups are not cached.
pub struct ProfileCache {
    cache: Cache<String, TraderProfile>,
}

impl ProfileCache {
    pub fn new(cfg: &config::Profiles) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(cfg.max_entries)
                .time_to_live(Duration::from_secs(cfg.ttl_secs))
                .build(),
        }
    }

    pub async fn get<P: ProfileSource>(&self, source: &P, address: &str) -> Result<TraderProfile> {
        let key = address.to_lowercase();
        if let Some(hit) = self.cache.get(&key).await {
            metrics::counter!("enricher_profile_cache_total", "result" => "hit").increment(1);
            return Ok(hit);
        }
        metrics::counter!("enricher_profile_cache_total", "result" => "miss").increment(1);
        let profile = source.fetch_profile(&key).await?;
        self.cache.insert(key, profile.clone()).await;
        Ok(profile)
    }
}
