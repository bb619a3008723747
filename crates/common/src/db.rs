use anyhow::Result;

/// Handle to the enricher's SQLite store.
///
/// Every statement executes on the single `tokio_rusqlite` worker thread, so
/// trade inserts and wallet upserts are serialized. Clones share that thread.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path` (or `:memory:`), set PRAGMAs and apply the
    /// schema, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        // Schema setup needs a write lock. Another process (sqlite3 shell, a
        // second enricher during deploy) may hold it briefly, so retry with
        // backoff instead of failing the start.
        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(5 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
                    conn.execute_batch(SCHEMA)?;
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(anyhow::Error::from(err).context("AsyncDb::open: schema failed"));
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: schema failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying schema setup"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Execute `function` against the connection on the SQLite thread.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records latency and error metrics under `op`.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        let status = if res.is_ok() { "ok" } else { "err" };
        metrics::histogram!("enricher_db_query_latency_ms", "op" => op, "status" => status)
            .record(ms);
        if res.is_err() {
            metrics::counter!("enricher_db_query_errors_total", "op" => op).increment(1);
        }

        res
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_key TEXT NOT NULL UNIQUE,     -- tx hash + asset + side + size, or composite fallback
    asset_id TEXT NOT NULL,
    condition_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    outcome_index INTEGER,
    side TEXT NOT NULL,                 -- BUY or SELL
    price REAL NOT NULL,
    size REAL NOT NULL,
    value REAL NOT NULL,                -- price * size (USDC)
    wallet TEXT,                        -- lowercased; NULL until resolved
    timestamp INTEGER NOT NULL,         -- unix epoch seconds
    transaction_hash TEXT,
    whale_tier TEXT,
    tags_json TEXT NOT NULL DEFAULT '[]',
    is_sweeper INTEGER NOT NULL DEFAULT 0,
    price_impact REAL,
    levels_consumed INTEGER,
    enrichment_status TEXT NOT NULL DEFAULT 'pending',  -- pending, enriched, failed
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    enriched_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_trades_condition_ts ON trades(condition_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_trades_ts ON trades(timestamp);
CREATE INDEX IF NOT EXISTS idx_trades_wallet ON trades(wallet);

CREATE TABLE IF NOT EXISTS wallet_profiles (
    address TEXT PRIMARY KEY,           -- lowercased
    tx_count INTEGER NOT NULL DEFAULT 0,            -- trades observed by this process
    external_trade_count INTEGER NOT NULL DEFAULT 0,
    total_pnl REAL NOT NULL DEFAULT 0.0,
    win_rate REAL NOT NULL DEFAULT 0.0,
    total_volume REAL NOT NULL DEFAULT 0.0,
    max_trade_value REAL NOT NULL DEFAULT 0.0,
    activity_level TEXT NOT NULL DEFAULT 'LOW',
    is_fresh INTEGER NOT NULL DEFAULT 1,
    is_smart_money INTEGER NOT NULL DEFAULT 0,
    is_whale INTEGER NOT NULL DEFAULT 0,
    last_trade_at INTEGER,
    profile_fetched_at TEXT,
    first_seen_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wallet_ranks (
    address TEXT NOT NULL,
    time_period TEXT NOT NULL,          -- DAY, WEEK, MONTH, ALL
    rank INTEGER NOT NULL,
    pnl REAL,
    volume REAL,
    user_name TEXT,
    refreshed_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (address, time_period)
);

CREATE TABLE IF NOT EXISTS signal_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    condition_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    window_hours INTEGER NOT NULL,
    total_volume REAL NOT NULL,
    top_tier_volume REAL NOT NULL,
    z_score REAL NOT NULL,
    hhi REAL NOT NULL,
    raw_confidence REAL NOT NULL,
    percentile INTEGER NOT NULL,
    signal_quality TEXT NOT NULL,
    metrics_json TEXT NOT NULL,
    run_id INTEGER NOT NULL,            -- one id per aggregation run
    is_sample INTEGER NOT NULL DEFAULT 0, -- 1 = feeds the volume baseline
    computed_at INTEGER NOT NULL        -- unix epoch seconds
);

CREATE INDEX IF NOT EXISTS idx_signal_snapshots_key
    ON signal_snapshots(condition_id, outcome, window_hours, computed_at);
CREATE INDEX IF NOT EXISTS idx_signal_snapshots_run
    ON signal_snapshots(window_hours, run_id);
"#;
