//! Coverage ledger: per (symbol, timeframe) interval of known-present bars.
//!
//! The interval is maintained incrementally from successful runs so gap
//! queries never have to scan the bars table. Interior holes are not
//! modeled; data is treated as contiguous once present, and `gaps` only
//! reports the prefix and suffix of the lookback window.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use crate::models::{ProviderId, Slice, Timeframe};
use crate::store::db::Db;

#[derive(Debug, Clone, PartialEq)]
pub struct CoverageRow {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from_ts: DateTime<Utc>,
    pub to_ts: DateTime<Utc>,
    pub last_success_at: DateTime<Utc>,
    pub last_rows_written: i64,
    pub last_provider: String,
}

#[derive(Clone)]
pub struct CoverageLedger {
    db: Db,
}

impl CoverageLedger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<CoverageRow>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT from_ts, to_ts, last_success_at, last_rows_written, last_provider
             FROM coverage_status
             WHERE symbol = ?1 AND timeframe = ?2
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![symbol, timeframe.as_str()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let from_ts: i64 = row.get(0)?;
        let to_ts: i64 = row.get(1)?;
        let last_success_at: i64 = row.get(2)?;
        Ok(Some(CoverageRow {
            symbol: symbol.to_string(),
            timeframe,
            from_ts: DateTime::from_timestamp(from_ts, 0)
                .context("coverage from_ts out of range")?,
            to_ts: DateTime::from_timestamp(to_ts, 0).context("coverage to_ts out of range")?,
            last_success_at: DateTime::from_timestamp(last_success_at, 0)
                .context("coverage last_success_at out of range")?,
            last_rows_written: row.get(3)?,
            last_provider: row.get(4)?,
        }))
    }

    /// Missing intervals inside the lookback window ending at `now`.
    /// A missing ledger entry yields the whole window; otherwise the prefix
    /// before the covered interval and the suffix after it, when non-empty.
    pub fn gaps(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Slice>> {
        let target_from = now - Duration::days(window_days);
        let target_to = now;

        let Some(cov) = self.get(symbol, timeframe)? else {
            return Ok(vec![Slice {
                from: target_from,
                to: target_to,
            }]);
        };

        let mut gaps = Vec::with_capacity(2);
        if target_from < cov.from_ts {
            gaps.push(Slice {
                from: target_from,
                to: cov.from_ts.min(target_to),
            });
        }
        if cov.to_ts < target_to {
            gaps.push(Slice {
                from: cov.to_ts.max(target_from),
                to: target_to,
            });
        }
        Ok(gaps)
    }

    /// Record a successful run. Only called with `rows_written > 0`; the
    /// interval expands monotonically and the `last_*` fields are
    /// last-writer-wins.
    pub fn record_success(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        slice_from: DateTime<Utc>,
        slice_to: DateTime<Utc>,
        rows_written: i64,
        provider: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        debug_assert!(rows_written > 0);
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO coverage_status
                (symbol, timeframe, from_ts, to_ts, last_success_at, last_rows_written, last_provider)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(symbol, timeframe) DO UPDATE SET
                from_ts = MIN(from_ts, excluded.from_ts),
                to_ts = MAX(to_ts, excluded.to_ts),
                last_success_at = excluded.last_success_at,
                last_rows_written = excluded.last_rows_written,
                last_provider = excluded.last_provider",
            params![
                symbol,
                timeframe.as_str(),
                slice_from.timestamp(),
                slice_to.timestamp(),
                now.timestamp(),
                rows_written,
                provider.as_str(),
            ],
        )
        .context("coverage upsert failed")?;
        Ok(())
    }
}
