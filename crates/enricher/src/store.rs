//! SQL for trades, wallet profiles, leaderboard ranks and signal snapshots.
//!
//! Every write that touches a wallet's counters runs in the same transaction
//! as the trade row change that justifies it, and only when that change
//! actually happened. Replaying a trade is therefore a no-op.

use crate::classifier::WhaleTier;
use crate::composite::EnhancedSignalMetrics;
use crate::market_impact::MarketImpact;
use crate::profiles::WalletProfile;
use anyhow::Result;
use common::db::AsyncDb;
use common::types::{ActivityLevel, EnrichmentStatus, Side};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub trade_key: String,
    pub asset_id: String,
    pub condition_id: String,
    pub outcome: String,
    pub outcome_index: Option<i64>,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub value: f64,
    pub wallet: Option<String>,
    pub timestamp: i64,
    pub transaction_hash: Option<String>,
    pub whale_tier: Option<WhaleTier>,
    pub tags: Vec<String>,
}

/// Counters maintained from observed trades.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WalletCounters {
    pub tx_count: u64,
    pub total_volume: f64,
    pub max_trade_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankRow {
    pub address: String,
    pub time_period: String,
    pub rank: i64,
    pub pnl: Option<f64>,
    pub volume: Option<f64>,
    pub user_name: Option<String>,
}

#[cfg(test)]
impl RankRow {
    pub fn new(address: &str, time_period: &str, rank: i64) -> Self {
        Self {
            address: address.to_string(),
            time_period: time_period.to_string(),
            rank,
            pnl: None,
            volume: None,
            user_name: None,
        }
    }
}

/// Trade fields the aggregation job needs.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowTrade {
    pub condition_id: String,
    pub outcome: String,
    pub wallet: Option<String>,
    pub side: Side,
    pub value: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalSnapshotRow {
    pub condition_id: String,
    pub outcome: String,
    pub window_hours: u32,
    pub total_volume: f64,
    pub top_tier_volume: f64,
    pub metrics: EnhancedSignalMetrics,
    pub computed_at: i64,
}

/// Whether a batch of snapshots feeds the volume baseline.
///
/// Only scheduled runs write samples; fast-path reruns replace the live view
/// without adding history, so bursts cannot flood the baseline with
/// near-identical volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Sample,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotRetention {
    /// Baseline samples kept per market/outcome/window.
    pub samples_per_key: u32,
    /// Rows computed before this epoch second are deleted.
    pub retain_since: i64,
}

/// Final write of an enrichment: wallet profile fields plus trade status.
#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub trade_id: i64,
    pub profile: Option<WalletProfile>,
    pub tags: Vec<String>,
    pub impact: Option<MarketImpact>,
}

const UPSERT_WALLET_COUNTERS: &str = "
    INSERT INTO wallet_profiles (address, tx_count, total_volume, max_trade_value, last_trade_at)
    VALUES (?1, 1, ?2, ?2, ?3)
    ON CONFLICT(address) DO UPDATE SET
        tx_count = tx_count + 1,
        total_volume = total_volume + excluded.total_volume,
        max_trade_value = MAX(max_trade_value, excluded.max_trade_value),
        last_trade_at = MAX(COALESCE(last_trade_at, 0), excluded.last_trade_at),
        updated_at = datetime('now')";

fn read_counters(conn: &rusqlite::Connection, address: &str) -> rusqlite::Result<WalletCounters> {
    conn.query_row(
        "SELECT tx_count, total_volume, max_trade_value FROM wallet_profiles WHERE address = ?1",
        [address],
        |row| {
            Ok(WalletCounters {
                tx_count: row.get::<_, i64>(0)?.max(0) as u64,
                total_volume: row.get(1)?,
                max_trade_value: row.get(2)?,
            })
        },
    )
    .optional()
    .map(Option::unwrap_or_default)
}

/// Fast-path insert. Returns the new row id, or `None` when the trade key was
/// already stored. A wallet known at this point is counted in the same
/// transaction.
pub async fn insert_pending_trade(db: &AsyncDb, rec: TradeRecord) -> Result<Option<i64>> {
    db.call_named("trades.insert_pending", move |conn| {
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO trades
                (trade_key, asset_id, condition_id, outcome, outcome_index, side, price, size,
                 value, wallet, timestamp, transaction_hash, whale_tier, tags_json, enrichment_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                rec.trade_key,
                rec.asset_id,
                rec.condition_id,
                rec.outcome,
                rec.outcome_index,
                rec.side.as_str(),
                rec.price,
                rec.size,
                rec.value,
                rec.wallet,
                rec.timestamp,
                rec.transaction_hash,
                rec.whale_tier.map(|t| t.as_str()),
                serde_json::to_string(&rec.tags)?,
                EnrichmentStatus::Pending.as_str(),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let id = tx.last_insert_rowid();
        if let Some(wallet) = &rec.wallet {
            tx.execute(UPSERT_WALLET_COUNTERS, params![wallet, rec.value, rec.timestamp])?;
        }
        tx.commit()?;
        Ok(Some(id))
    })
    .await
}

/// Attach `wallet` to a trade that has none yet and count the trade for it.
/// Returns the wallet's counters after the change (or unchanged, when the
/// trade was already attributed).
pub async fn attribute_wallet(db: &AsyncDb, trade_id: i64, wallet: String) -> Result<WalletCounters> {
    db.call_named("trades.attribute_wallet", move |conn| {
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE trades SET wallet = ?1 WHERE id = ?2 AND wallet IS NULL",
            params![wallet, trade_id],
        )?;
        if changed > 0 {
            let (value, ts): (f64, i64) = tx.query_row(
                "SELECT value, timestamp FROM trades WHERE id = ?1",
                [trade_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            tx.execute(UPSERT_WALLET_COUNTERS, params![wallet, value, ts])?;
        }
        let counters = read_counters(&tx, &wallet)?;
        tx.commit()?;
        Ok(counters)
    })
    .await
}

pub async fn finish_enrichment(db: &AsyncDb, outcome: EnrichmentOutcome) -> Result<()> {
    db.call_named("trades.finish_enrichment", move |conn| {
        let tx = conn.transaction()?;
        if let Some(p) = &outcome.profile {
            tx.execute(
                "UPDATE wallet_profiles SET
                    external_trade_count = MAX(external_trade_count, ?2),
                    total_pnl = ?3,
                    win_rate = ?4,
                    activity_level = ?5,
                    is_fresh = ?6,
                    is_smart_money = ?7,
                    is_whale = MAX(is_whale, ?8),
                    profile_fetched_at = datetime('now'),
                    updated_at = datetime('now')
                 WHERE address = ?1",
                params![
                    p.address,
                    p.external_trade_count as i64,
                    p.total_pnl,
                    p.win_rate,
                    p.activity_level.as_str(),
                    p.is_fresh,
                    p.is_smart_money,
                    p.is_whale,
                ],
            )?;
        }
        let impact = outcome.impact.as_ref();
        tx.execute(
            "UPDATE trades SET
                tags_json = ?2,
                is_sweeper = ?3,
                price_impact = ?4,
                levels_consumed = ?5,
                enrichment_status = ?6,
                enriched_at = datetime('now')
             WHERE id = ?1 AND enrichment_status = 'pending'",
            params![
                outcome.trade_id,
                serde_json::to_string(&outcome.tags)?,
                impact.is_some_and(|i| i.is_sweeper),
                impact.map(|i| i.price_impact),
                impact.map(|i| i.levels_consumed as i64),
                EnrichmentStatus::Enriched.as_str(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    })
    .await
}

pub async fn mark_failed(db: &AsyncDb, trade_id: i64) -> Result<()> {
    db.call_named("trades.mark_failed", move |conn| {
        conn.execute(
            "UPDATE trades SET enrichment_status = ?2, enriched_at = datetime('now')
             WHERE id = ?1 AND enrichment_status = 'pending'",
            params![trade_id, EnrichmentStatus::Failed.as_str()],
        )?;
        Ok(())
    })
    .await
}

#[cfg(test)]
pub async fn trade_status(db: &AsyncDb, trade_id: i64) -> Result<Option<EnrichmentStatus>> {
    db.call(move |conn| {
        let status: Option<String> = conn
            .query_row(
                "SELECT enrichment_status FROM trades WHERE id = ?1",
                [trade_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(EnrichmentStatus::from_str_loose))
    })
    .await
}

pub async fn load_wallet_profile(db: &AsyncDb, address: String) -> Result<Option<WalletProfile>> {
    db.call_named("wallet_profiles.load", move |conn| {
        let profile = conn
            .query_row(
                "SELECT address, total_pnl, win_rate, tx_count, external_trade_count, is_fresh,
                        activity_level, max_trade_value, is_smart_money, is_whale, updated_at
                 FROM wallet_profiles WHERE address = ?1",
                [&address],
                |row| {
                    let activity: String = row.get(6)?;
                    let updated_at: String = row.get(10)?;
                    Ok(WalletProfile {
                        address: row.get(0)?,
                        total_pnl: row.get(1)?,
                        win_rate: row.get(2)?,
                        tx_count: row.get::<_, i64>(3)?.max(0) as u64,
                        external_trade_count: row.get::<_, i64>(4)?.max(0) as u64,
                        is_fresh: row.get(5)?,
                        activity_level: match activity.as_str() {
                            "HIGH" => ActivityLevel::High,
                            "MEDIUM" => ActivityLevel::Medium,
                            _ => ActivityLevel::Low,
                        },
                        max_trade_value: row.get(7)?,
                        is_smart_money: row.get(8)?,
                        is_whale: row.get(9)?,
                        updated_at: chrono::NaiveDateTime::parse_from_str(
                            &updated_at,
                            "%Y-%m-%d %H:%M:%S",
                        )
                        .map(|dt| dt.and_utc())
                        .unwrap_or_else(|_| chrono::Utc::now()),
                    })
                },
            )
            .optional()?;
        Ok(profile)
    })
    .await
}

/// Replace all rows of one leaderboard period.
pub async fn replace_wallet_ranks(db: &AsyncDb, time_period: String, rows: Vec<RankRow>) -> Result<usize> {
    db.call_named("wallet_ranks.replace", move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM wallet_ranks WHERE time_period = ?1", [&time_period])?;
        let mut n = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO wallet_ranks
                    (address, time_period, rank, pnl, volume, user_name, refreshed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))",
            )?;
            for r in rows.iter().filter(|r| r.time_period == time_period) {
                n += stmt.execute(params![r.address, r.time_period, r.rank, r.pnl, r.volume, r.user_name])?;
            }
        }
        tx.commit()?;
        Ok(n)
    })
    .await
}

pub async fn load_wallet_ranks(db: &AsyncDb) -> Result<Vec<RankRow>> {
    db.call_named("wallet_ranks.load", |conn| {
        let mut stmt = conn.prepare(
            "SELECT address, time_period, rank, pnl, volume, user_name FROM wallet_ranks",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RankRow {
                    address: row.get(0)?,
                    time_period: row.get(1)?,
                    rank: row.get(2)?,
                    pnl: row.get(3)?,
                    volume: row.get(4)?,
                    user_name: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    })
    .await
}

/// Non-failed trades at or after `since_ts`.
pub async fn load_window_trades(db: &AsyncDb, since_ts: i64) -> Result<Vec<WindowTrade>> {
    db.call_named("trades.load_window", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT condition_id, outcome, wallet, side, value, timestamp
             FROM trades
             WHERE timestamp >= ?1 AND enrichment_status != 'failed'
             ORDER BY timestamp ASC",
        )?;
        let rows = stmt
            .query_map([since_ts], |row| {
                let side: String = row.get(3)?;
                Ok((
                    WindowTrade {
                        condition_id: row.get(0)?,
                        outcome: row.get(1)?,
                        wallet: row.get(2)?,
                        side: Side::Buy,
                        value: row.get(4)?,
                        timestamp: row.get(5)?,
                    },
                    side,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(mut t, side)| {
                t.side = Side::from_str_loose(&side)?;
                Some(t)
            })
            .collect())
    })
    .await
}

/// Most recent `(total_volume, top_tier_volume)` baseline samples per
/// market/outcome.
pub async fn load_baseline_samples(
    db: &AsyncDb,
    window_hours: u32,
    per_key: u32,
) -> Result<HashMap<(String, String), Vec<(f64, f64)>>> {
    db.call_named("signal_snapshots.baseline", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT condition_id, outcome, total_volume, top_tier_volume FROM (
                SELECT condition_id, outcome, total_volume, top_tier_volume,
                       ROW_NUMBER() OVER (
                           PARTITION BY condition_id, outcome ORDER BY computed_at DESC, id DESC
                       ) AS rn
                FROM signal_snapshots
                WHERE window_hours = ?1 AND is_sample = 1
             ) WHERE rn <= ?2",
        )?;
        let mut out: HashMap<(String, String), Vec<(f64, f64)>> = HashMap::new();
        let rows = stmt.query_map(params![window_hours, per_key], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;
        for row in rows {
            let (cid, outcome, total, top) = row?;
            out.entry((cid, outcome)).or_default().push((total, top));
        }
        Ok(out)
    })
    .await
}

/// Write one aggregation run for a window and prune what it supersedes.
///
/// In the same transaction: live rows of earlier runs for the window are
/// deleted, baseline samples beyond `samples_per_key` are trimmed, and any row
/// older than `retain_since` is dropped. Returns the number of rows inserted.
pub async fn insert_signal_snapshots(
    db: &AsyncDb,
    window_hours: u32,
    kind: SnapshotKind,
    rows: Vec<SignalSnapshotRow>,
    retention: SnapshotRetention,
) -> Result<usize> {
    db.call_named("signal_snapshots.insert", move |conn| {
        let tx = conn.transaction()?;
        let run_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(run_id), 0) + 1 FROM signal_snapshots",
            [],
            |row| row.get(0),
        )?;
        let is_sample = kind == SnapshotKind::Sample;
        let mut n = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO signal_snapshots
                    (condition_id, outcome, window_hours, total_volume, top_tier_volume, z_score,
                     hhi, raw_confidence, percentile, signal_quality, metrics_json, run_id,
                     is_sample, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for r in &rows {
                n += stmt.execute(params![
                    r.condition_id,
                    r.outcome,
                    window_hours,
                    r.total_volume,
                    r.top_tier_volume,
                    r.metrics.z_score,
                    r.metrics.hhi,
                    r.metrics.raw_confidence,
                    r.metrics.percentile,
                    r.metrics.signal_quality.as_str(),
                    serde_json::to_string(&r.metrics)?,
                    run_id,
                    is_sample,
                    r.computed_at,
                ])?;
            }
        }

        tx.execute(
            "DELETE FROM signal_snapshots
             WHERE window_hours = ?1 AND is_sample = 0 AND run_id < ?2",
            params![window_hours, run_id],
        )?;
        tx.execute(
            "DELETE FROM signal_snapshots WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY condition_id, outcome ORDER BY computed_at DESC, id DESC
                    ) AS rn
                    FROM signal_snapshots
                    WHERE window_hours = ?1 AND is_sample = 1
                ) WHERE rn > ?2
             )",
            params![window_hours, retention.samples_per_key],
        )?;
        tx.execute(
            "DELETE FROM signal_snapshots WHERE computed_at < ?1",
            params![retention.retain_since],
        )?;
        tx.commit()?;
        Ok(n)
    })
    .await
}

/// Rows of the most recent aggregation run for a window, best first.
pub async fn latest_signals(db: &AsyncDb, window_hours: u32, limit: u32) -> Result<Vec<SignalSnapshotRow>> {
    db.call_named("signal_snapshots.latest", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT condition_id, outcome, window_hours, total_volume, top_tier_volume,
                    metrics_json, computed_at
             FROM signal_snapshots
             WHERE window_hours = ?1
               AND run_id = (SELECT MAX(run_id) FROM signal_snapshots WHERE window_hours = ?1)
             ORDER BY raw_confidence DESC, id ASC
             LIMIT ?2",
        )?;
        let raw = stmt
            .query_map(params![window_hours, limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for (condition_id, outcome, window_hours, total_volume, top_tier_volume, json, computed_at) in raw
        {
            out.push(SignalSnapshotRow {
                condition_id,
                outcome,
                window_hours,
                total_volume,
                top_tier_volume,
                metrics: serde_json::from_str(&json)?,
                computed_at,
            });
        }
        Ok(out)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, wallet: Option<&str>, value: f64) -> TradeRecord {
        TradeRecord {
            trade_key: key.to_string(),
            asset_id: "111".to_string(),
            condition_id: "0xc1".to_string(),
            outcome: "Yes".to_string(),
            outcome_index: Some(0),
            side: Side::Buy,
            price: 0.5,
            size: value / 0.5,
            value,
            wallet: wallet.map(str::to_string),
            timestamp: 1_700_000_000,
            transaction_hash: None,
            whale_tier: None,
            tags: vec![],
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_for_counters() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let first = insert_pending_trade(&db, record("k1", Some("0xw"), 5_000.0))
            .await
            .unwrap();
        assert!(first.is_some());
        let again = insert_pending_trade(&db, record("k1", Some("0xw"), 5_000.0))
            .await
            .unwrap();
        assert!(again.is_none());

        let p = load_wallet_profile(&db, "0xw".to_string()).await.unwrap().unwrap();
        assert_eq!(p.tx_count, 1);
        assert_eq!(p.max_trade_value, 5_000.0);
    }

    #[tokio::test]
    async fn test_attribute_wallet_counts_once() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let id = insert_pending_trade(&db, record("k1", None, 2_000.0))
            .await
            .unwrap()
            .unwrap();
        insert_pending_trade(&db, record("k2", Some("0xw"), 9_000.0))
            .await
            .unwrap();

        let c = attribute_wallet(&db, id, "0xw".to_string()).await.unwrap();
        assert_eq!(c.tx_count, 2);
        assert_eq!(c.max_trade_value, 9_000.0);
        assert!((c.total_volume - 11_000.0).abs() < 1e-9);

        let c = attribute_wallet(&db, id, "0xw".to_string()).await.unwrap();
        assert_eq!(c.tx_count, 2);
    }

    #[tokio::test]
    async fn test_status_transitions_are_terminal() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let id = insert_pending_trade(&db, record("k1", None, 2_000.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trade_status(&db, id).await.unwrap(), Some(EnrichmentStatus::Pending));

        mark_failed(&db, id).await.unwrap();
        finish_enrichment(
            &db,
            EnrichmentOutcome {
                trade_id: id,
                profile: None,
                tags: vec!["STANDARD".to_string()],
                impact: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(trade_status(&db, id).await.unwrap(), Some(EnrichmentStatus::Failed));
    }

    #[tokio::test]
    async fn test_window_excludes_failed_and_old_trades() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let mut old = record("old", None, 1_000.0);
        old.timestamp = 1_600_000_000;
        insert_pending_trade(&db, old).await.unwrap();
        let failed = insert_pending_trade(&db, record("bad", None, 1_000.0))
            .await
            .unwrap()
            .unwrap();
        mark_failed(&db, failed).await.unwrap();
        let mut sell = record("ok", Some("0xw"), 3_000.0);
        sell.side = Side::Sell;
        insert_pending_trade(&db, sell).await.unwrap();

        let trades = load_window_trades(&db, 1_699_999_000).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Sell);
        assert_eq!(trades[0].wallet.as_deref(), Some("0xw"));
    }

    #[tokio::test]
    async fn test_replace_wallet_ranks_drops_stale_rows() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        replace_wallet_ranks(&db, "DAY".to_string(), vec![RankRow::new("0xa", "DAY", 1)])
            .await
            .unwrap();
        replace_wallet_ranks(&db, "ALL".to_string(), vec![RankRow::new("0xa", "ALL", 9)])
            .await
            .unwrap();
        replace_wallet_ranks(&db, "DAY".to_string(), vec![RankRow::new("0xb", "DAY", 2)])
            .await
            .unwrap();

        let mut rows = load_wallet_ranks(&db).await.unwrap();
        rows.sort_by(|a, b| a.address.cmp(&b.address));
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].address.as_str(), rows[0].rank), ("0xa", 9));
        assert_eq!((rows[1].address.as_str(), rows[1].rank), ("0xb", 2));
    }

    fn snapshot(cid: &str, total: f64, computed_at: i64) -> SignalSnapshotRow {
        SignalSnapshotRow {
            condition_id: cid.to_string(),
            outcome: "Yes".to_string(),
            window_hours: 24,
            total_volume: total,
            top_tier_volume: total / 2.0,
            metrics: crate::composite::calculate(&crate::composite::CompositeSignalInput::default()),
            computed_at,
        }
    }

    async fn count_snapshots(db: &AsyncDb, is_sample: bool) -> i64 {
        db.call(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM signal_snapshots WHERE is_sample = ?1",
                params![is_sample],
                |row| row.get(0),
            )?)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_history_is_bounded() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let retention = SnapshotRetention {
            samples_per_key: 2,
            retain_since: 0,
        };
        for i in 0..5 {
            let ts = 1_700_000_000 + i * 300;
            insert_signal_snapshots(&db, 24, SnapshotKind::Sample, vec![snapshot("0xc1", 1_000.0, ts)], retention)
                .await
                .unwrap();
            insert_signal_snapshots(&db, 24, SnapshotKind::Live, vec![snapshot("0xc1", 2_000.0, ts + 1)], retention)
                .await
                .unwrap();
        }

        assert_eq!(count_snapshots(&db, true).await, 2);
        assert_eq!(count_snapshots(&db, false).await, 1);

        let samples = load_baseline_samples(&db, 24, 10).await.unwrap();
        let key = ("0xc1".to_string(), "Yes".to_string());
        assert_eq!(samples[&key], vec![(1_000.0, 500.0), (1_000.0, 500.0)]);
    }

    #[tokio::test]
    async fn test_snapshots_past_retention_are_dropped() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let keep_all = SnapshotRetention {
            samples_per_key: 100,
            retain_since: 0,
        };
        insert_signal_snapshots(&db, 1, SnapshotKind::Sample, vec![snapshot("0xold", 1.0, 1_000)], keep_all)
            .await
            .unwrap();
        insert_signal_snapshots(
            &db,
            24,
            SnapshotKind::Sample,
            vec![snapshot("0xnew", 1.0, 5_000)],
            SnapshotRetention {
                samples_per_key: 100,
                retain_since: 2_000,
            },
        )
        .await
        .unwrap();

        assert!(load_baseline_samples(&db, 1, 10).await.unwrap().is_empty());
        assert_eq!(load_baseline_samples(&db, 24, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_signals_reads_only_the_newest_run() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let retention = SnapshotRetention {
            samples_per_key: 10,
            retain_since: 0,
        };
        // Two runs inside the same second.
        insert_signal_snapshots(
            &db,
            24,
            SnapshotKind::Sample,
            vec![snapshot("0xa", 1.0, 1_700_000_000), snapshot("0xb", 1.0, 1_700_000_000)],
            retention,
        )
        .await
        .unwrap();
        insert_signal_snapshots(&db, 24, SnapshotKind::Live, vec![snapshot("0xb", 3.0, 1_700_000_000)], retention)
            .await
            .unwrap();

        let rows = latest_signals(&db, 24, 20).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].condition_id, "0xb");
        assert_eq!(rows[0].total_volume, 3.0);
    }
}
