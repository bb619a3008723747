use crate::config;
use crate::rate_limit::AdaptiveRateLimiter;
use crate::types::{
    ApiLeaderboardEntry, ApiPosition, ApiTrade, ApiTradedCount, GammaMarket, OrderBook,
};
use anyhow::{Context, Result};
use reqwest::Url;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("rate limited by {endpoint}")]
    RateLimited { endpoint: &'static str },
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("{endpoint} request failed: {source}")]
    Transport {
        endpoint: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} response did not decode: {source}")]
    Decode {
        endpoint: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Status { status, .. } if *status >= 500 => "server",
            Self::Status { .. } => "client",
            Self::Transport { source, .. } if source.is_timeout() => "timeout",
            Self::Transport { .. } => "transport",
            Self::Decode { .. } => "decode",
        }
    }
}

/// Error kind label for metrics; anything that is not an [`ApiError`] is "other".
pub fn classify_api_error(e: &anyhow::Error) -> &'static str {
    e.downcast_ref::<ApiError>().map_or("other", ApiError::kind)
}

/// HTTP client for the Polymarket Gamma, Data and CLOB APIs.
///
/// Every request goes through the shared [`AdaptiveRateLimiter`]; 429s and
/// 5xx responses widen its spacing, successes narrow it again.
pub struct PolymarketClient {
    data_api_url: String,
    gamma_api_url: String,
    clob_api_url: String,
    client: reqwest::Client,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl PolymarketClient {
    pub fn new(cfg: &config::Polymarket, limiter: Arc<AdaptiveRateLimiter>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            data_api_url: cfg.data_api_url.trim_end_matches('/').to_string(),
            gamma_api_url: cfg.gamma_api_url.trim_end_matches('/').to_string(),
            clob_api_url: cfg.clob_api_url.trim_end_matches('/').to_string(),
            client,
            limiter,
        })
    }

    pub fn data_api_url(&self) -> &str {
        &self.data_api_url
    }

    pub fn gamma_api_url(&self) -> &str {
        &self.gamma_api_url
    }

    pub fn clob_api_url(&self) -> &str {
        &self.clob_api_url
    }

    fn build_url(base: &str, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{base}{path}"))
            .with_context(|| format!("invalid API url: {base}{path}"))?;
        {
            let mut qp = url.query_pairs_mut();
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &'static str, url: Url) -> Result<T> {
        self.limiter.acquire().await;
        tracing::debug!(endpoint, url = %url, "GET");

        let resp = match self.client.get(url).send().await {
            Ok(resp) => resp,
            Err(source) => {
                self.limiter.record_failure().await;
                return Err(ApiError::Transport { endpoint, source }.into());
            }
        };

        let status = resp.status();
        if status.as_u16() == 429 {
            self.limiter.record_failure().await;
            return Err(ApiError::RateLimited { endpoint }.into());
        }
        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(source) => {
                self.limiter.record_failure().await;
                return Err(ApiError::Transport { endpoint, source }.into());
            }
        };
        if !status.is_success() {
            if status.is_server_error() {
                self.limiter.record_failure().await;
            }
            let body = String::from_utf8_lossy(&body).chars().take(512).collect();
            return Err(ApiError::Status {
                endpoint,
                status: status.as_u16(),
                body,
            }
            .into());
        }

        self.limiter.record_success().await;
        serde_json::from_slice(&body).map_err(|source| ApiError::Decode { endpoint, source }.into())
    }

    /// One page of active, unresolved markets.
    pub async fn fetch_gamma_markets_raw(&self, limit: u32, offset: u32) -> Result<Vec<GammaMarket>> {
        let url = Self::build_url(
            &self.gamma_api_url,
            "/markets",
            &[
                ("limit", &limit.to_string()),
                ("offset", &offset.to_string()),
                ("active", "true"),
                ("closed", "false"),
            ],
        )?;
        self.get_json("gamma_markets", url).await
    }

    pub async fn fetch_positions_raw(&self, user: &str, limit: u32) -> Result<Vec<ApiPosition>> {
        let url = Self::build_url(
            &self.data_api_url,
            "/positions",
            &[
                ("user", user),
                ("limit", &limit.to_string()),
                ("sizeThreshold", "0"),
            ],
        )?;
        self.get_json("positions", url).await
    }

    pub async fn fetch_traded_count_raw(&self, user: &str) -> Result<ApiTradedCount> {
        let url = Self::build_url(&self.data_api_url, "/traded", &[("user", user)])?;
        self.get_json("traded", url).await
    }

    pub async fn fetch_leaderboard_raw(
        &self,
        category: &str,
        time_period: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ApiLeaderboardEntry>> {
        let url = Self::build_url(
            &self.data_api_url,
            "/v1/leaderboard",
            &[
                ("category", category),
                ("timePeriod", time_period),
                ("orderBy", "PNL"),
                ("limit", &limit.to_string()),
                ("offset", &offset.to_string()),
            ],
        )?;
        self.get_json("leaderboard", url).await
    }

    /// Recent trades on one market; used to attribute a transaction hash to a wallet.
    pub async fn fetch_market_trades_raw(
        &self,
        condition_id: &str,
        limit: u32,
    ) -> Result<Vec<ApiTrade>> {
        let url = Self::build_url(
            &self.data_api_url,
            "/trades",
            &[
                ("market", condition_id),
                ("limit", &limit.to_string()),
                ("takerOnly", "false"),
            ],
        )?;
        self.get_json("market_trades", url).await
    }

    pub async fn fetch_order_book_raw(&self, token_id: &str) -> Result<OrderBook> {
        let url = Self::build_url(&self.clob_api_url, "/book", &[("token_id", token_id)])?;
        self.get_json("order_book", url).await
    }
}
