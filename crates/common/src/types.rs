use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse activity bucket derived from a wallet's transaction count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityLevel {
    Low,
    Medium,
    High,
}

impl ActivityLevel {
    pub const MEDIUM_MIN_TX: u64 = 10;
    pub const HIGH_MIN_TX: u64 = 50;

    pub fn from_tx_count(tx_count: u64) -> Self {
        if tx_count >= Self::HIGH_MIN_TX {
            Self::High
        } else if tx_count >= Self::MEDIUM_MIN_TX {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Enriched => "enriched",
            Self::Failed => "failed",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "enriched" => Some(Self::Enriched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Market from Gamma API `/markets`. Several list-valued fields arrive as
/// JSON-encoded strings (e.g. `"[\"Yes\",\"No\"]"`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaMarket {
    #[serde(rename = "conditionId")]
    pub condition_id: Option<String>,
    pub question: Option<String>,
    pub slug: Option<String>,
    #[serde(rename = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    pub outcomes: Option<String>,
    pub category: Option<String>,
    #[serde(rename = "sportsMarketType")]
    pub sport: Option<String>,
    pub league: Option<String>,
    #[serde(rename = "liquidityNum")]
    pub liquidity: Option<f64>,
    #[serde(rename = "volume24hr")]
    pub volume_24h: Option<f64>,
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(rename = "umaEndDate")]
    pub resolution_date: Option<String>,
    pub events: Option<Vec<GammaEventRef>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaEventRef {
    pub slug: Option<String>,
    pub title: Option<String>,
}

impl GammaMarket {
    /// Decode a JSON-encoded string list; malformed input yields an empty list.
    pub fn decode_list(raw: Option<&str>) -> Vec<String> {
        raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
    }

    pub fn token_ids(&self) -> Vec<String> {
        Self::decode_list(self.clob_token_ids.as_deref())
    }

    pub fn outcome_labels(&self) -> Vec<String> {
        Self::decode_list(self.outcomes.as_deref())
    }

    pub fn event_slug(&self) -> Option<&str> {
        self.events
            .as_ref()
            .and_then(|events| events.first())
            .and_then(|e| e.slug.as_deref())
    }
}

/// Trade from Data API `/trades`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTrade {
    #[serde(rename = "proxyWallet")]
    pub proxy_wallet: Option<String>,
    #[serde(rename = "conditionId")]
    pub condition_id: Option<String>,
    pub asset: Option<String>,
    pub side: Option<String>,
    pub timestamp: Option<i64>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: Option<String>,
}

/// Position from Data API `/positions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPosition {
    #[serde(rename = "proxyWallet")]
    pub proxy_wallet: Option<String>,
    #[serde(rename = "conditionId")]
    pub condition_id: Option<String>,
    #[serde(rename = "currentValue")]
    pub current_value: Option<f64>,
    #[serde(rename = "cashPnl")]
    pub cash_pnl: Option<f64>,
    #[serde(rename = "realizedPnl")]
    pub realized_pnl: Option<f64>,
}

/// Data API `/traded` response: lifetime count of markets traded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiTradedCount {
    pub user: Option<String>,
    pub traded: Option<u64>,
}

/// Leaderboard entry from Data API `/v1/leaderboard`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiLeaderboardEntry {
    pub rank: Option<String>,
    #[serde(rename = "proxyWallet")]
    pub proxy_wallet: Option<String>,
    #[serde(rename = "userName")]
    pub user_name: Option<String>,
    pub vol: Option<f64>,
    pub pnl: Option<f64>,
}

/// A single price level from the CLOB order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    #[serde(deserialize_with = "de_string_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_string_f64")]
    pub size: f64,
}

/// CLOB `/book` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub asset_id: Option<String>,
    #[serde(default)]
    pub bids: Vec<BookLevel>,
    #[serde(default)]
    pub asks: Vec<BookLevel>,
}

/// Deserialize a price/size that may be a JSON string or number.
pub fn de_string_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct StringOrNumber;

    impl<'de> de::Visitor<'de> for StringOrNumber {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a number or numeric string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            v.trim().parse::<f64>().map_err(E::custom)
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v as f64)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v as f64)
        }
    }

    deserializer.deserialize_any(StringOrNumber)
}
