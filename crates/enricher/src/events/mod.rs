//! Event types published on the [`EventBus`](crate::event_bus::EventBus).
//!
//! - Pipeline events: trade previews, enriched trades, ranked signals
//!   (broadcast, every subscriber sees every event)
//! - Fast-path trigger: "new trades landed", coalesced through a watch channel
//! - Operational events: job lifecycle, feed connectivity, backpressure

pub mod subscribers;

use crate::classifier::WhaleTier;
use crate::composite::SignalQuality;
use crate::market_impact::MarketImpact;
use chrono::{DateTime, Utc};
use common::types::{ActivityLevel, Side};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradePhase {
    Preview,
    Enriched,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeView {
    pub trade_id: i64,
    pub trade_key: String,
    pub asset_id: String,
    pub condition_id: String,
    pub outcome: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub value: f64,
    pub timestamp: i64,
    pub transaction_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketView {
    pub question: String,
    pub slug: Option<String>,
    pub event_slug: Option<String>,
    pub category: Option<String>,
    pub liquidity: f64,
    pub volume_24h: f64,
}

/// Wallet context. The preview carries the placeholder from
/// [`WalletView::unresolved`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletView {
    pub address: Option<String>,
    pub best_rank: Option<i64>,
    pub total_pnl: f64,
    pub win_rate: f64,
    pub tx_count: u64,
    pub activity_level: ActivityLevel,
    pub is_fresh: bool,
    pub is_smart_money: bool,
}

impl WalletView {
    pub fn unresolved(address: Option<String>) -> Self {
        Self {
            address,
            best_rank: None,
            total_pnl: 0.0,
            win_rate: 0.0,
            tx_count: 0,
            activity_level: ActivityLevel::Low,
            is_fresh: false,
            is_smart_money: false,
        }
    }
}

/// Outbound trade notification. The JSON shape is the same for both phases.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeEvent {
    pub phase: TradePhase,
    pub trade: TradeView,
    pub market: MarketView,
    pub wallet: WalletView,
    pub whale_tier: Option<WhaleTier>,
    pub tags: Vec<String>,
    pub impact: Option<MarketImpact>,
    pub emitted_at: DateTime<Utc>,
}

/// One row of a ranked signal batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedSignal {
    pub condition_id: String,
    pub outcome: String,
    pub question: Option<String>,
    pub dominant_side: Side,
    pub total_volume: f64,
    pub raw_confidence: f64,
    pub percentile: u8,
    pub signal_quality: SignalQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// Fast-path classification, emitted before any upstream lookup.
    TradePreview { trade: Box<TradeEvent> },

    TradeEnriched { trade: Box<TradeEvent> },

    /// Enrichment gave up on a trade; terminal.
    TradeFailed {
        trade_id: i64,
        trade_key: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },

    /// Percentile-ranked signals for one window, best first.
    SignalsRanked {
        window_hours: u32,
        signals: Vec<RankedSignal>,
        computed_at: DateTime<Utc>,
    },

    MetadataRefreshed {
        markets: usize,
        assets: usize,
        refreshed_at: DateTime<Utc>,
    },

    RanksRefreshed {
        wallets: usize,
        refreshed_at: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TradePreview { .. } => "trade_preview",
            Self::TradeEnriched { .. } => "trade_enriched",
            Self::TradeFailed { .. } => "trade_failed",
            Self::SignalsRanked { .. } => "signals_ranked",
            Self::MetadataRefreshed { .. } => "metadata_refreshed",
            Self::RanksRefreshed { .. } => "ranks_refreshed",
        }
    }
}

/// Coalescing wakeup for the aggregation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FastPathTrigger {
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationalEvent {
    JobStarted {
        job_name: String,
        started_at: DateTime<Utc>,
    },
    JobCompleted {
        job_name: String,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    JobFailed {
        job_name: String,
        error: String,
        failed_at: DateTime<Utc>,
    },
    FeedConnected {
        url: String,
        connected_at: DateTime<Utc>,
    },
    FeedDisconnected {
        error: String,
        reconnect_in_ms: u64,
        disconnected_at: DateTime<Utc>,
    },
    /// Queue approaching capacity
    BackpressureWarning {
        queue_name: String,
        current_size: usize,
        capacity: usize,
        warned_at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade(phase: TradePhase) -> TradeEvent {
        TradeEvent {
            phase,
            trade: TradeView {
                trade_id: 7,
                trade_key: "0xabc:111:BUY:240000".to_string(),
                asset_id: "111".to_string(),
                condition_id: "0xc1".to_string(),
                outcome: "Yes".to_string(),
                side: Side::Buy,
                price: 0.5,
                size: 240_000.0,
                value: 120_000.0,
                timestamp: 1_700_000_000,
                transaction_hash: Some("0xabc".to_string()),
            },
            market: MarketView {
                question: "Will it rain?".to_string(),
                slug: Some("rain".to_string()),
                event_slug: None,
                category: None,
                liquidity: 1.0,
                volume_24h: 2.0,
            },
            wallet: WalletView::unresolved(None),
            whale_tier: Some(WhaleTier::GodWhale),
            tags: vec!["GOD_WHALE".to_string(), "WHALE".to_string()],
            impact: None,
            emitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_trade_event_shape_is_stable_across_phases() {
        let preview = serde_json::to_value(sample_trade(TradePhase::Preview)).unwrap();
        let enriched = serde_json::to_value(sample_trade(TradePhase::Enriched)).unwrap();
        assert_eq!(preview["phase"], "preview");
        assert_eq!(enriched["phase"], "enriched");
        let keys = |v: &serde_json::Value| {
            let mut k: Vec<String> = v.as_object().unwrap().keys().cloned().collect();
            k.sort();
            k
        };
        assert_eq!(keys(&preview), keys(&enriched));
        assert_eq!(preview["whale_tier"], "GOD_WHALE");
        assert_eq!(preview["trade"]["side"], "BUY");
        assert!(preview["impact"].is_null());
    }

    #[test]
    fn test_pipeline_event_is_tagged() {
        let event = PipelineEvent::SignalsRanked {
            window_hours: 24,
            signals: vec![],
            computed_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "signals_ranked");
        assert_eq!(json["window_hours"], 24);
        assert_eq!(event.kind(), "signals_ranked");
    }

    #[test]
    fn test_operational_event_is_tagged() {
        let event = OperationalEvent::FeedDisconnected {
            error: "reset".to_string(),
            reconnect_in_ms: 2000,
            disconnected_at: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "feed_disconnected");
        assert_eq!(json["reconnect_in_ms"], 2000);
    }
}
