use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_histogram!(
        "enricher_api_latency_ms",
        "Polymarket API request latency in milliseconds."
    );
    describe_counter!(
        "enricher_api_requests_total",
        "Number of Polymarket API requests made."
    );
    describe_counter!(
        "enricher_api_errors_total",
        "Polymarket API errors by kind."
    );
    describe_gauge!(
        "enricher_rate_limit_delay_ms",
        "Current adaptive rate limiter delay in milliseconds."
    );
    describe_histogram!(
        "enricher_db_query_latency_ms",
        "SQLite query latency in milliseconds, by operation."
    );
    describe_counter!(
        "enricher_db_query_errors_total",
        "SQLite query errors, by operation."
    );
    describe_counter!(
        "enricher_tracing_events_total",
        "WARN and ERROR tracing events emitted."
    );
    describe_counter!(
        "enricher_source_timeouts_total",
        "Upstream lookups abandoned after their timeout, by source."
    );

    describe_counter!(
        "enricher_metadata_refresh_total",
        "Market metadata refresh attempts, by result."
    );
    describe_gauge!("enricher_metadata_markets", "Markets in the metadata cache.");
    describe_gauge!("enricher_metadata_assets", "Assets in the metadata cache.");
    describe_gauge!(
        "enricher_metadata_evicted",
        "Metadata entries dropped on the last refresh because the cache was full."
    );
    describe_gauge!(
        "enricher_metadata_loaded_timestamp_seconds",
        "Unix time the current metadata snapshot was built."
    );
    describe_gauge!(
        "enricher_ranked_wallets",
        "Wallets with a leaderboard rank."
    );
    describe_gauge!(
        "enricher_ranked_wallets_by_tier",
        "Ranked wallets per leaderboard tier."
    );
    describe_counter!(
        "enricher_profile_cache_total",
        "Trader profile cache lookups, by hit or miss."
    );

    describe_counter!(
        "enricher_feed_connects_total",
        "Successful trade feed connections."
    );
    describe_gauge!(
        "enricher_feed_connected",
        "1 while the trade feed is connected, else 0."
    );
    describe_counter!(
        "enricher_feed_disconnects_total",
        "Trade feed disconnects."
    );
    describe_counter!(
        "enricher_feed_trades_total",
        "Trades received from the feed."
    );
    describe_counter!(
        "enricher_feed_malformed_total",
        "Feed messages that failed to parse."
    );

    describe_counter!(
        "enricher_trades_filtered_total",
        "Trades rejected by the admission filters, by reason."
    );
    describe_counter!(
        "enricher_trades_duplicate_total",
        "Trades dropped as already stored."
    );
    describe_counter!(
        "enricher_trades_accepted_total",
        "Trades accepted for enrichment, by tier."
    );
    describe_counter!(
        "enricher_trades_enriched_total",
        "Trades that finished enrichment."
    );
    describe_counter!(
        "enricher_trades_failed_total",
        "Trades whose enrichment failed."
    );
    describe_histogram!(
        "enricher_enrichment_latency_ms",
        "Time from admission to enriched event in milliseconds."
    );
    describe_gauge!(
        "enricher_enrichments_in_flight",
        "Enrichment tasks currently running."
    );

    describe_counter!(
        "enricher_events_published_total",
        "Pipeline events delivered to at least one subscriber, by kind."
    );
    describe_counter!(
        "enricher_events_dropped_total",
        "Pipeline events dropped under backpressure, by kind."
    );
    describe_counter!(
        "enricher_events_unobserved_total",
        "Pipeline events published with no subscriber, by kind."
    );

    describe_counter!(
        "enricher_aggregation_runs_total",
        "Signal aggregation runs, by result."
    );
    describe_gauge!(
        "enricher_active_signals",
        "Signals in the latest aggregation run, by window."
    );
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("enricher_trades_enriched_total").increment(1);
            metrics::gauge!("enricher_active_signals", "window_hours" => "24").set(3.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("enricher_trades_enriched_total"));
        assert!(rendered.contains("enricher_active_signals"));
        assert!(rendered.contains("Trades that finished enrichment."));
    }
}
