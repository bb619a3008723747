use anyhow::{Context, Result};
use serde::Deserialize;
use std::str::FromStr;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub polymarket: Polymarket,
    pub feed: Feed,
    pub classifier: Classifier,
    pub filters: Filters,
    pub metadata: Metadata,
    pub leaderboard: Leaderboard,
    pub profiles: Profiles,
    pub enrichment: Enrichment,
    pub rate_limit: RateLimit,
    pub signals: Signals,
    pub events: Events,
    pub observability: Observability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Polymarket {
    pub data_api_url: String,
    pub gamma_api_url: String,
    pub clob_api_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Feed {
    pub ws_url: String,
    pub initial_backoff_ms: u64,
    pub max_backoff_secs: u64,
    pub channel_capacity: usize,
}

/// Notional thresholds (USDC) for each whale tier, ascending.
#[derive(Debug, Clone, Deserialize)]
pub struct Classifier {
    pub standard: f64,
    pub whale: f64,
    pub mega_whale: f64,
    pub super_whale: f64,
    pub god_whale: f64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            standard: 1_000.0,
            whale: 8_000.0,
            mega_whale: 15_000.0,
            super_whale: 50_000.0,
            god_whale: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Filters {
    pub min_trade_value: f64,
    pub resolved_price_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub refresh_interval_secs: u64,
    pub max_markets: usize,
    pub max_assets: usize,
    pub page_size: u32,
    pub max_pages: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Leaderboard {
    pub refresh_interval_secs: u64,
    pub time_periods: Vec<String>,
    pub category: String,
    pub depth: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profiles {
    pub ttl_secs: u64,
    pub max_entries: u64,
    pub fresh_wallet_max_tx: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Enrichment {
    pub profile_timeout_ms: u64,
    pub order_book_timeout_ms: u64,
    pub max_sweep_levels: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Signals {
    pub refresh_interval_secs: u64,
    pub windows_hours: Vec<u32>,
    pub baseline_samples: u32,
    pub decay_lambda: f64,
    /// Snapshots older than this are deleted after each aggregation run.
    pub retention_hours: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Events {
    pub bus_capacity: usize,
    pub log_trade_events: bool,
    pub backpressure: String,
    pub warn_threshold_pct: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
    pub json_logs: bool,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Load from `ENRICHER_CONFIG` when set, else the default path.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("ENRICHER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).context("failed to parse enricher config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let c = &self.classifier;
        anyhow::ensure!(
            c.standard < c.whale
                && c.whale < c.mega_whale
                && c.mega_whale < c.super_whale
                && c.super_whale < c.god_whale,
            "classifier thresholds must be strictly ascending"
        );
        anyhow::ensure!(
            self.filters.min_trade_value >= 0.0,
            "filters.min_trade_value must be >= 0"
        );
        anyhow::ensure!(
            self.filters.resolved_price_threshold > 0.0
                && self.filters.resolved_price_threshold <= 1.0,
            "filters.resolved_price_threshold must be in (0, 1]"
        );
        anyhow::ensure!(
            self.metadata.max_markets > 0 && self.metadata.max_assets > 0,
            "metadata cache capacities must be > 0"
        );
        anyhow::ensure!(
            !self.signals.windows_hours.is_empty(),
            "signals.windows_hours must not be empty"
        );
        let longest = self.signals.windows_hours.iter().copied().max().unwrap_or(0);
        anyhow::ensure!(
            self.signals.retention_hours >= longest.max(1),
            "signals.retention_hours must cover the longest signal window"
        );
        anyhow::ensure!(
            self.rate_limit.min_delay_ms <= self.rate_limit.max_delay_ms,
            "rate_limit.min_delay_ms must be <= rate_limit.max_delay_ms"
        );
        anyhow::ensure!(self.events.bus_capacity > 0, "events.bus_capacity must be > 0");
        anyhow::ensure!(
            matches!(self.events.backpressure.as_str(), "drop_oldest" | "drop_newest"),
            "events.backpressure must be \"drop_oldest\" or \"drop_newest\""
        );
        anyhow::ensure!(
            self.events.warn_threshold_pct <= 100,
            "events.warn_threshold_pct must be <= 100"
        );
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_toml_str(s)
    }
}
