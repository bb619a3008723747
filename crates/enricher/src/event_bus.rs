//! In-process event bus.
//!
//! Two channel kinds:
//!
//! - **`broadcast`** for pipeline and operational events. Every subscriber
//!   sees every event: the logging subscriber, downstream alert sinks, tests.
//! - **`watch`** for the fast-path trigger. Only the latest generation
//!   matters, so a burst of enriched trades wakes the aggregation job once.
//!
//! Publishing never fails: with no subscribers the event is counted and
//! discarded.

use crate::events::{FastPathTrigger, OperationalEvent, PipelineEvent};
use chrono::Utc;
use common::config;
use tokio::sync::{broadcast, watch};

/// Policy applied when the pipeline channel is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Let slow subscribers lag (default broadcast behaviour).
    #[default]
    DropOldest,
    /// Discard the event being published.
    DropNewest,
}

#[derive(Clone)]
pub struct EventBus {
    pipeline_tx: broadcast::Sender<PipelineEvent>,
    fast_path_tx: watch::Sender<FastPathTrigger>,
    operational_tx: broadcast::Sender<OperationalEvent>,
    capacity: usize,
    pipeline_backpressure: BackpressurePolicy,
    /// Fill percentage at which a `BackpressureWarning` is emitted.
    warn_threshold_pct: u8,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (pipeline_tx, _) = broadcast::channel(capacity);
        let (fast_path_tx, _) = watch::channel(FastPathTrigger::default());
        let (operational_tx, _) = broadcast::channel(capacity);

        Self {
            pipeline_tx,
            fast_path_tx,
            operational_tx,
            capacity,
            pipeline_backpressure: BackpressurePolicy::default(),
            warn_threshold_pct: 90,
        }
    }

    pub fn from_config(cfg: &config::Events) -> Self {
        let policy = match cfg.backpressure.as_str() {
            "drop_newest" => BackpressurePolicy::DropNewest,
            _ => BackpressurePolicy::DropOldest,
        };
        Self::new(cfg.bus_capacity)
            .with_backpressure_policy(policy)
            .with_warn_threshold_pct(cfg.warn_threshold_pct)
    }

    pub fn with_backpressure_policy(mut self, policy: BackpressurePolicy) -> Self {
        self.pipeline_backpressure = policy;
        self
    }

    pub fn with_warn_threshold_pct(mut self, pct: u8) -> Self {
        self.warn_threshold_pct = pct.min(100);
        self
    }

    /// Publish a pipeline event and return how many subscribers received it.
    pub fn publish_pipeline(&self, event: PipelineEvent) -> usize {
        let kind = event.kind();
        let current_len = self.pipeline_tx.len();
        let threshold = (self.capacity as u64 * u64::from(self.warn_threshold_pct) / 100) as usize;

        if threshold > 0 && current_len >= threshold {
            self.publish_operational(OperationalEvent::BackpressureWarning {
                queue_name: "pipeline".to_string(),
                current_size: current_len,
                capacity: self.capacity,
                warned_at: Utc::now(),
            });
        }

        if self.pipeline_backpressure == BackpressurePolicy::DropNewest
            && current_len >= self.capacity
        {
            tracing::warn!(
                kind,
                current_len,
                capacity = self.capacity,
                "pipeline channel full, dropping newest event"
            );
            metrics::counter!("enricher_events_dropped_total", "kind" => kind).increment(1);
            return 0;
        }

        match self.pipeline_tx.send(event) {
            Ok(n) => {
                metrics::counter!("enricher_events_published_total", "kind" => kind).increment(1);
                n
            }
            Err(_) => {
                metrics::counter!("enricher_events_unobserved_total", "kind" => kind).increment(1);
                0
            }
        }
    }

    pub fn subscribe_pipeline(&self) -> broadcast::Receiver<PipelineEvent> {
        self.pipeline_tx.subscribe()
    }

    /// Bump the fast-path generation. Bursts coalesce into one wakeup.
    pub fn trigger_fast_path(&self) {
        self.fast_path_tx.send_modify(|trigger| {
            trigger.generation += 1;
        });
    }

    pub fn subscribe_fast_path(&self) -> watch::Receiver<FastPathTrigger> {
        self.fast_path_tx.subscribe()
    }

    pub fn publish_operational(&self, event: OperationalEvent) -> usize {
        self.operational_tx.send(event).unwrap_or(0)
    }

    pub fn subscribe_operational(&self) -> broadcast::Receiver<OperationalEvent> {
        self.operational_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks_refreshed(wallets: usize) -> PipelineEvent {
        PipelineEvent::RanksRefreshed {
            wallets,
            refreshed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_pipeline_events() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe_pipeline();
        let mut rx2 = bus.subscribe_pipeline();

        assert_eq!(bus.publish_pipeline(ranks_refreshed(3)), 2);

        assert!(matches!(rx1.recv().await.unwrap(), PipelineEvent::RanksRefreshed { wallets: 3, .. }));
        assert!(matches!(rx2.recv().await.unwrap(), PipelineEvent::RanksRefreshed { wallets: 3, .. }));
    }

    #[test]
    fn test_publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(16);
        assert_eq!(bus.publish_pipeline(ranks_refreshed(1)), 0);
        assert_eq!(
            bus.publish_operational(OperationalEvent::JobStarted {
                job_name: "x".to_string(),
                started_at: Utc::now(),
            }),
            0
        );
    }

    #[tokio::test]
    async fn test_fast_path_coalesces_triggers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe_fast_path();
        assert_eq!(rx.borrow().generation, 0);

        bus.trigger_fast_path();
        bus.trigger_fast_path();
        bus.trigger_fast_path();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().generation, 3);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_queued_events() {
        let bus = EventBus::new(4).with_backpressure_policy(BackpressurePolicy::DropNewest);
        let mut rx = bus.subscribe_pipeline();
        for i in 0..4 {
            assert_eq!(bus.publish_pipeline(ranks_refreshed(i)), 1);
        }
        assert_eq!(bus.publish_pipeline(ranks_refreshed(999)), 0);

        for i in 0..4 {
            match rx.recv().await.unwrap() {
                PipelineEvent::RanksRefreshed { wallets, .. } => assert_eq!(wallets, i),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_lags_slow_subscriber() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe_pipeline();
        for i in 0..5 {
            bus.publish_pipeline(ranks_refreshed(i));
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 1),
            Ok(PipelineEvent::RanksRefreshed { wallets, .. }) => assert!(wallets > 0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_backpressure_warning_at_threshold() {
        let bus = EventBus::new(10).with_warn_threshold_pct(90);
        let _pipeline_rx = bus.subscribe_pipeline();
        let mut ops = bus.subscribe_operational();

        for i in 0..9 {
            bus.publish_pipeline(ranks_refreshed(i));
        }
        assert!(ops.try_recv().is_err());

        bus.publish_pipeline(ranks_refreshed(9));
        match ops.try_recv().unwrap() {
            OperationalEvent::BackpressureWarning {
                queue_name,
                current_size,
                capacity,
                ..
            } => {
                assert_eq!(queue_name, "pipeline");
                assert_eq!(current_size, 9);
                assert_eq!(capacity, 10);
            }
            other => panic!("expected BackpressureWarning, got {other:?}"),
        }
    }

    #[test]
    fn test_from_config_applies_policy() {
        let bus = EventBus::from_config(&config::Events {
            bus_capacity: 2,
            log_trade_events: false,
            backpressure: "drop_newest".to_string(),
            warn_threshold_pct: 100,
        });
        let _rx = bus.subscribe_pipeline();
        assert_eq!(bus.publish_pipeline(ranks_refreshed(1)), 1);
        assert_eq!(bus.publish_pipeline(ranks_refreshed(2)), 1);
        assert_eq!(bus.publish_pipeline(ranks_refreshed(3)), 0);
    }
}
