use crate::event_bus::EventBus;
use crate::events::PipelineEvent;
use crate::sources::LeaderboardSource;
use crate::store::{self, RankRow};
use crate::tiers::{self, Tier};
use anyhow::Result;
use common::config;
use common::db::AsyncDb;
use common::types::ApiLeaderboardEntry;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A wallet's best standing across the tracked leaderboard periods.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletRank {
    pub rank: i64,
    pub time_period: String,
    pub pnl: Option<f64>,
    pub user_name: Option<String>,
}

impl WalletRank {
    pub fn tier(&self) -> Option<Tier> {
        tiers::tier_of(self.rank)
    }
}

/// Rows for one leaderboard page. A missing or unparsable rank falls back to
/// the entry's position in the list.
pub fn rows_from_entries(time_period: &str, entries: &[ApiLeaderboardEntry]) -> Vec<RankRow> {
    entries
        .iter()
        .enumerate()
        .filter_map(|(idx, e)| {
            let address = e.proxy_wallet.as_deref()?.trim().to_lowercase();
            if address.is_empty() {
                return None;
            }
            let rank = e
                .rank
                .as_deref()
                .and_then(|r| r.trim().parse::<i64>().ok())
                .unwrap_or(idx as i64 + 1);
            Some(RankRow {
                address,
                time_period: time_period.to_string(),
                rank,
                pnl: e.pnl,
                volume: e.vol,
                user_name: e.user_name.clone(),
            })
        })
        .collect()
}

/// Best (lowest positive) rank per wallet.
pub fn best_ranks(rows: &[RankRow]) -> HashMap<String, WalletRank> {
    let mut out: HashMap<String, WalletRank> = HashMap::new();
    for row in rows.iter().filter(|r| r.rank > 0) {
        let better = out.get(&row.address).map_or(true, |cur| row.rank < cur.rank);
        if better {
            out.insert(
                row.address.clone(),
                WalletRank {
                    rank: row.rank,
                    time_period: row.time_period.clone(),
                    pnl: row.pnl,
                    user_name: row.user_name.clone(),
                },
            );
        }
    }
    out
}

/// Wallets per leaderboard tier; ranks outside every tier are not counted.
pub fn tier_counts(ranks: &HashMap<String, WalletRank>) -> BTreeMap<Tier, usize> {
    let mut out = BTreeMap::new();
    for tier in ranks.values().filter_map(WalletRank::tier) {
        *out.entry(tier).or_default() += 1;
    }
    out
}

pub struct RankBook {
    cfg: config::Leaderboard,
    ranks: RwLock<Arc<HashMap<String, WalletRank>>>,
    cancel: CancellationToken,
}

impl RankBook {
    pub fn new(cfg: config::Leaderboard) -> Self {
        Self {
            cfg,
            ranks: RwLock::new(Arc::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, WalletRank>> {
        self.ranks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, wallet: &str) -> Option<WalletRank> {
        self.snapshot().get(&wallet.to_lowercase()).cloned()
    }

    pub fn best_rank(&self, wallet: &str) -> Option<i64> {
        self.get(wallet).map(|r| r.rank)
    }

    fn swap(&self, ranks: HashMap<String, WalletRank>) {
        metrics::gauge!("enricher_ranked_wallets").set(ranks.len() as f64);
        let counts = tier_counts(&ranks);
        for tier in [Tier::Elite, Tier::Gold, Tier::Silver, Tier::Bronze] {
            let n = counts.get(&tier).copied().unwrap_or(0);
            metrics::gauge!("enricher_ranked_wallets_by_tier", "tier" => tier.as_str()).set(n as f64);
        }
        *self.ranks.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(ranks);
    }

    /// Seed from ranks persisted by a previous run.
    pub async fn init_from_db(&self, db: &AsyncDb) -> Result<usize> {
        let rows = store::load_wallet_ranks(db).await?;
        let ranks = best_ranks(&rows);
        let n = ranks.len();
        if n > 0 {
            self.swap(ranks);
        }
        tracing::info!(wallets = n, "rank book replayed from database");
        Ok(n)
    }

    /// Fetch every configured period and swap in the merged book. A period
    /// that fails keeps its previously persisted rows; if every period fails
    /// the in-memory book is left untouched.
    pub async fn refresh<L: LeaderboardSource>(&self, source: &L, db: &AsyncDb) -> Result<usize> {
        let mut fetched = 0usize;
        let mut last_err = None;
        for period in &self.cfg.time_periods {
            match source
                .fetch_leaderboard(&self.cfg.category, period, self.cfg.depth)
                .await
            {
                Ok(entries) => {
                    let rows = rows_from_entries(period, &entries);
                    store::replace_wallet_ranks(db, period.clone(), rows).await?;
                    fetched += 1;
                }
                Err(e) => {
                    tracing::warn!(time_period = %period, error = %e, "leaderboard fetch failed");
                    last_err = Some(e);
                }
            }
        }
        if fetched == 0 {
            if let Some(e) = last_err {
                return Err(e.context("all leaderboard periods failed"));
            }
        }

        let rows = store::load_wallet_ranks(db).await?;
        let ranks = best_ranks(&rows);
        let n = ranks.len();
        self.swap(ranks);
        tracing::info!(wallets = n, periods = fetched, "rank book refreshed");
        Ok(n)
    }

    pub fn spawn_refresh<L>(self: &Arc<Self>, source: Arc<L>, db: AsyncDb, bus: EventBus) -> JoinHandle<()>
    where
        L: LeaderboardSource + Send + Sync + 'static,
    {
        let this = Arc::clone(self);
        let period = Duration::from_secs(this.cfg.refresh_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = this.cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match this.refresh(source.as_ref(), &db).await {
                            Ok(wallets) => {
                                bus.publish_pipeline(PipelineEvent::RanksRefreshed {
                                    wallets,
                                    refreshed_at: chrono::Utc::now(),
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "rank book refresh failed; keeping previous ranks");
                            }
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fakes::{entry, FakeLeaderboard};
    use std::sync::atomic::Ordering;

    fn cfg() -> config::Leaderboard {
        config::Leaderboard {
            refresh_interval_secs: 3600,
            time_periods: vec!["DAY".to_string(), "ALL".to_string()],
            category: "OVERALL".to_string(),
            depth: 200,
        }
    }

    #[test]
    fn test_rows_fall_back_to_position() {
        let mut e = entry(0, "0xAAA", 10.0);
        e.rank = None;
        let rows = rows_from_entries("DAY", &[entry(1, "0xbbb", 5.0), e]);
        assert_eq!(rows[1].rank, 2);
        assert_eq!(rows[1].address, "0xaaa");
    }

    #[test]
    fn test_best_rank_is_minimum_across_periods() {
        let rows = vec![
            RankRow::new("0xa", "DAY", 40),
            RankRow::new("0xa", "ALL", 7),
            RankRow::new("0xb", "DAY", 3),
            RankRow::new("0xc", "ALL", 0),
        ];
        let best = best_ranks(&rows);
        assert_eq!(best["0xa"].rank, 7);
        assert_eq!(best["0xa"].time_period, "ALL");
        assert_eq!(best["0xb"].rank, 3);
        assert!(!best.contains_key("0xc"));
    }

    #[test]
    fn test_tier_counts_skip_unscored_ranks() {
        let rows = vec![
            RankRow::new("0xa", "DAY", 1),
            RankRow::new("0xb", "DAY", 8),
            RankRow::new("0xc", "DAY", 55),
            RankRow::new("0xd", "DAY", 900),
        ];
        let counts = tier_counts(&best_ranks(&rows));
        assert_eq!(counts.get(&Tier::Elite), Some(&2));
        assert_eq!(counts.get(&Tier::Silver), Some(&1));
        assert_eq!(counts.get(&Tier::Gold), None);
        assert_eq!(counts.values().sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_refresh_merges_periods_and_persists() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut source = FakeLeaderboard::default();
        source
            .boards
            .insert("DAY".to_string(), vec![entry(12, "0xA", 1.0), entry(2, "0xB", 1.0)]);
        source
            .boards
            .insert("ALL".to_string(), vec![entry(5, "0xa", 1.0)]);

        let book = RankBook::new(cfg());
        assert_eq!(book.refresh(&source, &db).await.unwrap(), 2);
        assert_eq!(book.best_rank("0xA"), Some(5));
        assert_eq!(book.get("0xb").unwrap().tier(), Some(Tier::Elite));

        // A fresh book replays the same state from the database.
        let replayed = RankBook::new(cfg());
        assert_eq!(replayed.init_from_db(&db).await.unwrap(), 2);
        assert_eq!(replayed.best_rank("0xa"), Some(5));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_ranks() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut source = FakeLeaderboard::default();
        source
            .boards
            .insert("DAY".to_string(), vec![entry(1, "0xa", 1.0)]);
        let book = RankBook::new(cfg());
        book.refresh(&source, &db).await.unwrap();

        source.fail.store(true, Ordering::SeqCst);
        assert!(book.refresh(&source, &db).await.is_err());
        assert_eq!(book.best_rank("0xa"), Some(1));
    }
}
