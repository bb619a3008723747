use serde::{Deserialize, Serialize};

/// Leaderboard tier of a wallet, from its best rank. Rank 1 is best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Elite,
    Gold,
    Silver,
    Bronze,
}

impl Tier {
    /// Inclusive upper rank bound of the tier.
    pub const fn max_rank(self) -> i64 {
        match self {
            Self::Elite => 10,
            Self::Gold => 30,
            Self::Silver => 100,
            Self::Bronze => 200,
        }
    }

    pub const fn weight(self) -> f64 {
        match self {
            Self::Elite => 1.0,
            Self::Gold => 0.6,
            Self::Silver => 0.3,
            Self::Bronze => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Elite => "ELITE",
            Self::Gold => "GOLD",
            Self::Silver => "SILVER",
            Self::Bronze => "BRONZE",
        }
    }
}

pub fn tier_of(rank: i64) -> Option<Tier> {
    if rank <= 0 {
        return None;
    }
    [Tier::Elite, Tier::Gold, Tier::Silver, Tier::Bronze]
        .into_iter()
        .find(|t| rank <= t.max_rank())
}

pub fn weight_of(rank: i64) -> f64 {
    tier_of(rank).map_or(0.0, Tier::weight)
}

/// Sum of tier weights; unranked wallets contribute nothing.
pub fn weighted_count<I>(ranks: I) -> f64
where
    I: IntoIterator<Item = i64>,
{
    ranks.into_iter().map(weight_of).sum()
}
