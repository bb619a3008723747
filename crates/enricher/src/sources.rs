//! External data sources consumed by the enricher, and their Polymarket-backed
//! implementations.

use anyhow::Result;
use common::polymarket::{classify_api_error, PolymarketClient};
use common::types::{ApiLeaderboardEntry, GammaMarket, OrderBook};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

const POSITIONS_LIMIT: u32 = 500;
const RESOLVE_TRADES_LIMIT: u32 = 200;

/// Aggregate trading record for one wallet, as reported upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraderProfile {
    pub address: String,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub total_trades: u64,
    pub open_position_value: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{source_name} timed out after {after:?}")]
    Timeout {
        source_name: &'static str,
        after: Duration,
    },
    #[error("no wallet found for transaction {tx_hash}")]
    UnresolvedWallet { tx_hash: String },
}

/// Bound `fut` by `after`, mapping elapsed time to [`SourceError::Timeout`].
pub async fn with_timeout<T, F>(source_name: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => {
            metrics::counter!("enricher_source_timeouts_total", "source" => source_name)
                .increment(1);
            Err(SourceError::Timeout { source_name, after }.into())
        }
    }
}

pub trait MetadataSource {
    fn fetch_markets(
        &self,
        page_size: u32,
        max_pages: u32,
    ) -> impl Future<Output = Result<Vec<GammaMarket>>> + Send;
}

pub trait ProfileSource {
    fn fetch_profile(&self, address: &str) -> impl Future<Output = Result<TraderProfile>> + Send;

    /// Find the wallet behind a transaction on a given market and asset.
    fn resolve_wallet(
        &self,
        condition_id: &str,
        asset_id: &str,
        tx_hash: &str,
    ) -> impl Future<Output = Result<Option<String>>> + Send;
}

pub trait LeaderboardSource {
    fn fetch_leaderboard(
        &self,
        category: &str,
        time_period: &str,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<ApiLeaderboardEntry>>> + Send;
}

pub trait OrderBookSource {
    fn fetch_order_book(&self, asset_id: &str) -> impl Future<Output = Result<OrderBook>> + Send;
}

fn observe<T>(endpoint: &'static str, start: Instant, res: &Result<T>) {
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("enricher_api_latency_ms", "endpoint" => endpoint).record(ms);
    match res {
        Ok(_) => {
            metrics::counter!("enricher_api_requests_total", "endpoint" => endpoint, "status" => "ok")
                .increment(1);
        }
        Err(e) => {
            metrics::counter!("enricher_api_requests_total", "endpoint" => endpoint, "status" => "error")
                .increment(1);
            metrics::counter!(
                "enricher_api_errors_total",
                "endpoint" => endpoint,
                "kind" => classify_api_error(e)
            )
            .increment(1);
        }
    }
}

/// Reduce raw positions to PnL, win rate and open value.
pub fn summarize_positions(
    address: &str,
    positions: &[common::types::ApiPosition],
    traded: Option<u64>,
) -> TraderProfile {
    let mut total_pnl = 0.0;
    let mut open_value = 0.0;
    let mut wins = 0u32;
    let mut decided = 0u32;
    for p in positions {
        let pnl = p.cash_pnl.or(p.realized_pnl).unwrap_or(0.0);
        total_pnl += pnl;
        open_value += p.current_value.unwrap_or(0.0);
        if pnl > 0.0 {
            wins += 1;
        }
        if pnl != 0.0 {
            decided += 1;
        }
    }
    TraderProfile {
        address: address.to_lowercase(),
        total_pnl,
        win_rate: if decided == 0 {
            0.0
        } else {
            f64::from(wins) / f64::from(decided)
        },
        total_trades: traded.unwrap_or(positions.len() as u64),
        open_position_value: open_value,
    }
}

impl MetadataSource for PolymarketClient {
    async fn fetch_markets(&self, page_size: u32, max_pages: u32) -> Result<Vec<GammaMarket>> {
        let start = Instant::now();
        let mut markets = Vec::new();
        let mut res = Ok(());
        for page in 0..max_pages {
            match self.fetch_gamma_markets_raw(page_size, page * page_size).await {
                Ok(batch) => {
                    let short = (batch.len() as u32) < page_size;
                    markets.extend(batch);
                    if short {
                        break;
                    }
                }
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }
        let res = res.map(|()| markets);
        observe("gamma_markets", start, &res);
        res
    }
}

impl ProfileSource for PolymarketClient {
    async fn fetch_profile(&self, address: &str) -> Result<TraderProfile> {
        let start = Instant::now();
        let res: Result<TraderProfile> = async {
            let (positions, traded) = tokio::try_join!(
                self.fetch_positions_raw(address, POSITIONS_LIMIT),
                self.fetch_traded_count_raw(address),
            )?;
            Ok(summarize_positions(address, &positions, traded.traded))
        }
        .await;
        observe("profile", start, &res);
        res
    }

    async fn resolve_wallet(
        &self,
        condition_id: &str,
        asset_id: &str,
        tx_hash: &str,
    ) -> Result<Option<String>> {
        let start = Instant::now();
        let res = self
            .fetch_market_trades_raw(condition_id, RESOLVE_TRADES_LIMIT)
            .await
            .map(|trades| {
                trades
                    .into_iter()
                    .filter(|t| {
                        t.transaction_hash
                            .as_deref()
                            .is_some_and(|h| h.eq_ignore_ascii_case(tx_hash))
                    })
                    .filter(|t| t.asset.as_deref().map_or(true, |a| a == asset_id))
                    .find_map(|t| t.proxy_wallet)
                    .map(|w| w.to_lowercase())
            });
        observe("resolve_wallet", start, &res);
        res
    }
}

impl LeaderboardSource for PolymarketClient {
    async fn fetch_leaderboard(
        &self,
        category: &str,
        time_period: &str,
        limit: u32,
    ) -> Result<Vec<ApiLeaderboardEntry>> {
        let start = Instant::now();
        // The endpoint caps page size at 50.
        let page = limit.min(50);
        let mut entries = Vec::new();
        let mut res = Ok(());
        let mut offset = 0;
        while offset < limit {
            match self
                .fetch_leaderboard_raw(category, time_period, page, offset)
                .await
            {
                Ok(batch) => {
                    let short = (batch.len() as u32) < page;
                    entries.extend(batch);
                    if short {
                        break;
                    }
                }
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
            offset += page;
        }
        let res = res.map(|()| entries);
        observe("leaderboard", start, &res);
        res
    }
}

impl OrderBookSource for PolymarketClient {
    async fn fetch_order_book(&self, asset_id: &str) -> Result<OrderBook> {
        let start = Instant::now();
        let res = self.fetch_order_book_raw(asset_id).await;
        observe("order_book", start, &res);
        res
    }
}
