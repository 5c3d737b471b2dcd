//! Shared SQLite handle for the ingestion store.
//!
//! One database file holds every table: bars, job catalog, queue, coverage,
//! rate buckets, checkpoints. WAL mode keeps readers unblocked during the
//! worker upsert bursts.

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};
use std::sync::Arc;
use tracing::{info, warn};

/// Schema with optimizations for steady bar ingestion.
const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for better concurrent access
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS symbols (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL UNIQUE,
    asset_type TEXT NOT NULL DEFAULT 'equity',
    description TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- One row per (symbol, timeframe, ts, provider, is_forecast) bar identity.
-- Prices are 4-decimal fixed point; volume is an integer.
CREATE TABLE IF NOT EXISTS bars (
    symbol_id INTEGER NOT NULL REFERENCES symbols(id),
    timeframe TEXT NOT NULL,
    ts INTEGER NOT NULL,
    open INTEGER NOT NULL,
    high INTEGER NOT NULL,
    low INTEGER NOT NULL,
    close INTEGER NOT NULL,
    volume INTEGER NOT NULL DEFAULT 0,
    provider TEXT NOT NULL,
    is_intraday INTEGER NOT NULL DEFAULT 0,
    is_forecast INTEGER NOT NULL DEFAULT 0,
    data_status TEXT NOT NULL DEFAULT 'live',
    confidence_score REAL,
    upper_band INTEGER,
    lower_band INTEGER,
    fetched_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    PRIMARY KEY (symbol_id, timeframe, ts, provider, is_forecast)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_bars_window
    ON bars(symbol_id, timeframe, is_forecast, ts);

CREATE TABLE IF NOT EXISTS job_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    symbol_id INTEGER NOT NULL REFERENCES symbols(id),
    timeframe TEXT NOT NULL,
    kind TEXT NOT NULL,
    window_days INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 100,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(symbol, timeframe, kind)
);

CREATE TABLE IF NOT EXISTS job_runs (
    id TEXT PRIMARY KEY,
    job_def_id INTEGER NOT NULL REFERENCES job_definitions(id) ON DELETE CASCADE,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    kind TEXT NOT NULL,
    slice_from INTEGER NOT NULL,
    slice_to INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    attempt INTEGER NOT NULL DEFAULT 1,
    progress_pct INTEGER NOT NULL DEFAULT 0,
    rows_written INTEGER NOT NULL DEFAULT 0,
    provider TEXT,
    error_code TEXT,
    error_message TEXT,
    triggered_by TEXT NOT NULL DEFAULT 'cron',
    idx_hash TEXT NOT NULL,
    seq INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_job_runs_claim
    ON job_runs(status, created_at, seq);

CREATE INDEX IF NOT EXISTS idx_job_runs_hash
    ON job_runs(idx_hash, status);

CREATE INDEX IF NOT EXISTS idx_job_runs_def
    ON job_runs(job_def_id);

CREATE TABLE IF NOT EXISTS coverage_status (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    from_ts INTEGER NOT NULL,
    to_ts INTEGER NOT NULL,
    last_success_at INTEGER NOT NULL,
    last_rows_written INTEGER NOT NULL,
    last_provider TEXT NOT NULL,
    PRIMARY KEY (symbol, timeframe)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS rate_buckets (
    provider TEXT PRIMARY KEY,
    capacity REAL NOT NULL,
    refill_per_minute REAL NOT NULL,
    tokens REAL NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

-- Advisory resume pointers for long historical fetches.
CREATE TABLE IF NOT EXISTS provider_checkpoints (
    provider TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    cursor_ts INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (provider, symbol, timeframe)
) WITHOUT ROWID;

-- Which user surface asked for a symbol (watchlist, chart_view, ...).
CREATE TABLE IF NOT EXISTS user_symbols (
    ticker TEXT NOT NULL,
    source TEXT NOT NULL,
    tracked_at INTEGER NOT NULL,
    PRIMARY KEY (ticker, source)
) WITHOUT ROWID;
"#;

/// Cloneable handle to the single shared connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX; // We handle our own locking

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        Self::init(conn, db_path)
    }

    /// In-memory database for tests.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, db_path: &str) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" && db_path != ":memory:" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("📊 Ingestion store initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Optimize database (run periodically, e.g. daily).
    pub fn optimize(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "PRAGMA optimize;
             PRAGMA wal_checkpoint(TRUNCATE);",
        )?;
        info!("🔧 Database optimized");
        Ok(())
    }
}
