use common::config;
use common::types::ActivityLevel;
use serde::{Deserialize, Serialize};

pub const TAG_WHALE: &str = "WHALE";
pub const TAG_SMART_MONEY: &str = "SMART_MONEY";
pub const TAG_FRESH_WALLET: &str = "FRESH_WALLET";
pub const TAG_SWEEPER: &str = "SWEEPER";
pub const TAG_INSIDER: &str = "INSIDER";
pub const TAG_TOP_TRADER: &str = "TOP_TRADER";

const INSIDER_MIN_WIN_RATE: f64 = 0.7;
const INSIDER_MIN_PNL: f64 = 10_000.0;
const SMART_MONEY_MAX_RANK: i64 = 200;
const SMART_MONEY_MIN_PNL: f64 = 25_000.0;
const SMART_MONEY_MIN_WIN_RATE: f64 = 0.6;

/// Size class of a single trade by notional value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WhaleTier {
    Standard,
    Whale,
    MegaWhale,
    SuperWhale,
    GodWhale,
}

impl WhaleTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::Whale => "WHALE",
            Self::MegaWhale => "MEGA_WHALE",
            Self::SuperWhale => "SUPER_WHALE",
            Self::GodWhale => "GOD_WHALE",
        }
    }

    pub fn is_whale(&self) -> bool {
        *self >= Self::Whale
    }
}

pub struct TradeClassifier {
    thresholds: config::Classifier,
}

impl TradeClassifier {
    pub fn new(thresholds: config::Classifier) -> Self {
        Self { thresholds }
    }

    /// Highest tier whose threshold the value reaches; `None` below STANDARD.
    pub fn classify(&self, value: f64) -> Option<WhaleTier> {
        let t = &self.thresholds;
        [
            (t.god_whale, WhaleTier::GodWhale),
            (t.super_whale, WhaleTier::SuperWhale),
            (t.mega_whale, WhaleTier::MegaWhale),
            (t.whale, WhaleTier::Whale),
            (t.standard, WhaleTier::Standard),
        ]
        .into_iter()
        .find(|(threshold, _)| value >= *threshold)
        .map(|(_, tier)| tier)
    }
}

impl Default for TradeClassifier {
    fn default() -> Self {
        Self::new(config::Classifier::default())
    }
}

pub fn is_insider(activity: ActivityLevel, win_rate: f64, pnl: f64) -> bool {
    activity == ActivityLevel::Low && win_rate > INSIDER_MIN_WIN_RATE && pnl > INSIDER_MIN_PNL
}

pub fn is_smart_money(best_rank: Option<i64>, pnl: f64, win_rate: f64) -> bool {
    let ranked = best_rank.is_some_and(|r| (1..=SMART_MONEY_MAX_RANK).contains(&r));
    ranked || (pnl >= SMART_MONEY_MIN_PNL && win_rate >= SMART_MONEY_MIN_WIN_RATE)
}

/// Flags feeding [`build_analysis_tags`].
#[derive(Debug, Clone, Default)]
pub struct TagFlags {
    pub smart_money: bool,
    pub fresh_wallet: bool,
    pub sweeper: bool,
    pub insider: bool,
    pub top_trader: bool,
    pub extra: Vec<String>,
}

/// Tier tag first, then flags, then caller tags. No duplicates; first
/// occurrence wins.
pub fn build_analysis_tags(tier: Option<WhaleTier>, flags: &TagFlags) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    let mut push = |tag: &str| {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    };

    if let Some(tier) = tier {
        push(tier.as_str());
        if tier.is_whale() {
            push(TAG_WHALE);
        }
    }
    for (on, tag) in [
        (flags.smart_money, TAG_SMART_MONEY),
        (flags.fresh_wallet, TAG_FRESH_WALLET),
        (flags.sweeper, TAG_SWEEPER),
        (flags.insider, TAG_INSIDER),
        (flags.top_trader, TAG_TOP_TRADER),
    ] {
        if on {
            push(tag);
        }
    }
    for tag in &flags.extra {
        push(tag);
    }
    tags
}
