//! Bus subscribers.

use crate::event_bus::EventBus;
use crate::events::{OperationalEvent, PipelineEvent, TradeEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

fn log_trade(event_type: &'static str, trade: &TradeEvent) {
    tracing::info!(
        event_type,
        trade_id = trade.trade.trade_id,
        condition_id = %trade.trade.condition_id,
        outcome = %trade.trade.outcome,
        side = %trade.trade.side,
        value = trade.trade.value,
        wallet = trade.wallet.address.as_deref().unwrap_or("-"),
        tier = trade.whale_tier.map_or("-", |t| t.as_str()),
        tags = %trade.tags.join(","),
        "trade event"
    );
}

fn log_pipeline(event: &PipelineEvent, log_trades: bool) {
    match event {
        PipelineEvent::TradePreview { trade } => {
            if log_trades {
                log_trade("trade_preview", trade);
            }
        }
        PipelineEvent::TradeEnriched { trade } => {
            if log_trades {
                log_trade("trade_enriched", trade);
            }
        }
        PipelineEvent::TradeFailed {
            trade_id,
            trade_key,
            reason,
            ..
        } => {
            tracing::warn!(event_type = "trade_failed", trade_id, %trade_key, %reason, "trade enrichment failed");
        }
        PipelineEvent::SignalsRanked {
            window_hours,
            signals,
            ..
        } => {
            let top = signals.first();
            tracing::info!(
                event_type = "signals_ranked",
                window_hours,
                signals = signals.len(),
                top_condition = top.map_or("-", |s| s.condition_id.as_str()),
                top_outcome = top.map_or("-", |s| s.outcome.as_str()),
                top_confidence = top.map_or(0.0, |s| s.raw_confidence),
                "signals ranked"
            );
        }
        PipelineEvent::MetadataRefreshed {
            markets, assets, ..
        } => {
            tracing::info!(event_type = "metadata_refreshed", markets, assets, "metadata refreshed");
        }
        PipelineEvent::RanksRefreshed { wallets, .. } => {
            tracing::info!(event_type = "ranks_refreshed", wallets, "ranks refreshed");
        }
    }
}

fn log_operational(event: &OperationalEvent) {
    match event {
        OperationalEvent::JobStarted { job_name, .. } => {
            tracing::debug!(event_type = "job_started", %job_name, "job started");
        }
        OperationalEvent::JobCompleted {
            job_name,
            duration_ms,
            ..
        } => {
            tracing::info!(event_type = "job_completed", %job_name, duration_ms, "job completed");
        }
        OperationalEvent::JobFailed { job_name, error, .. } => {
            tracing::warn!(event_type = "job_failed", %job_name, %error, "job failed");
        }
        OperationalEvent::FeedConnected { url, .. } => {
            tracing::info!(event_type = "feed_connected", %url, "feed connected");
        }
        OperationalEvent::FeedDisconnected {
            error,
            reconnect_in_ms,
            ..
        } => {
            tracing::warn!(event_type = "feed_disconnected", %error, reconnect_in_ms, "feed disconnected");
        }
        OperationalEvent::BackpressureWarning {
            queue_name,
            current_size,
            capacity,
            ..
        } => {
            tracing::warn!(
                event_type = "backpressure_warning",
                %queue_name,
                current_size,
                capacity,
                "queue near capacity"
            );
        }
    }
}

/// Log every pipeline and operational event until `cancel` fires or the bus
/// is dropped. Returns the number of events seen.
pub async fn run_logging_subscriber(
    event_bus: &EventBus,
    log_trades: bool,
    cancel: CancellationToken,
) -> u64 {
    let mut pipeline_rx = event_bus.subscribe_pipeline();
    let mut operational_rx = event_bus.subscribe_operational();
    let mut seen = 0u64;
    let mut pipeline_open = true;
    let mut operational_open = true;

    while pipeline_open || operational_open {
        tokio::select! {
            () = cancel.cancelled() => break,
            res = pipeline_rx.recv(), if pipeline_open => match res {
                Ok(event) => {
                    seen += 1;
                    log_pipeline(&event, log_trades);
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "logging subscriber lagged on pipeline events");
                }
                Err(RecvError::Closed) => pipeline_open = false,
            },
            res = operational_rx.recv(), if operational_open => match res {
                Ok(event) => {
                    seen += 1;
                    log_operational(&event);
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "logging subscriber lagged on operational events");
                }
                Err(RecvError::Closed) => operational_open = false,
            },
        }
    }
    tracing::info!(seen, "logging subscriber stopped");
    seen
}
