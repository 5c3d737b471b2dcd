//! Job catalog: durable definitions of what must stay fresh.
//!
//! One row per (symbol, timeframe, kind). Re-subscribing re-enables and can
//! raise the priority; definitions are soft-disabled to pause, never
//! deleted during normal operation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::models::{JobKind, Timeframe};
use crate::store::db::Db;

#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub id: i64,
    pub symbol: String,
    pub symbol_id: i64,
    pub timeframe: Timeframe,
    pub kind: JobKind,
    pub window_days: i64,
    pub priority: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct JobCatalog {
    db: Db,
}

impl JobCatalog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create or refresh a definition. Changing window or priority takes
    /// effect at the next orchestrator tick; an existing disabled row is
    /// re-enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_definition(
        &self,
        symbol: &str,
        symbol_id: i64,
        timeframe: Timeframe,
        kind: JobKind,
        window_days: i64,
        priority: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO job_definitions
                (symbol, symbol_id, timeframe, kind, window_days, priority, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)
             ON CONFLICT(symbol, timeframe, kind) DO UPDATE SET
                window_days = excluded.window_days,
                priority = MAX(priority, excluded.priority),
                enabled = 1,
                updated_at = excluded.updated_at",
            params![
                symbol,
                symbol_id,
                timeframe.as_str(),
                kind.as_str(),
                window_days,
                priority,
                now.timestamp(),
            ],
        )
        .context("job definition upsert failed")?;

        let id: i64 = conn.query_row(
            "SELECT id FROM job_definitions WHERE symbol = ?1 AND timeframe = ?2 AND kind = ?3",
            params![symbol, timeframe.as_str(), kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn set_enabled(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        kind: JobKind,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE job_definitions SET enabled = ?1, updated_at = ?2
             WHERE symbol = ?3 AND timeframe = ?4 AND kind = ?5",
            params![
                enabled as i64,
                now.timestamp(),
                symbol,
                timeframe.as_str(),
                kind.as_str(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Enabled definitions ordered highest priority first; equal priorities
    /// keep creation order so older subscriptions are never starved.
    pub fn list_enabled(&self) -> Result<Vec<JobDefinition>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, symbol_id, timeframe, kind, window_days, priority, enabled, created_at
             FROM job_definitions
             WHERE enabled = 1
             ORDER BY priority DESC, created_at ASC, id ASC",
        )?;
        let defs = stmt
            .query_map([], row_to_definition)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(defs)
    }

    /// Remember which user surface asked for a ticker.
    pub fn track_user_symbol(&self, ticker: &str, source: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO user_symbols (ticker, source, tracked_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(ticker, source) DO UPDATE SET tracked_at = excluded.tracked_at",
            params![ticker, source, now.timestamp()],
        )?;
        Ok(())
    }

    pub fn tracked_symbol_count(&self) -> Result<i64> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT ticker) FROM user_symbols",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn enabled_count(&self) -> Result<i64> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_definitions WHERE enabled = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_definition(row: &rusqlite::Row) -> rusqlite::Result<JobDefinition> {
    let timeframe_str: String = row.get(3)?;
    let kind_str: String = row.get(4)?;
    let created_at: i64 = row.get(8)?;

    let timeframe = Timeframe::parse_str(&timeframe_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown timeframe {}", timeframe_str).into(),
        )
    })?;
    let kind = JobKind::parse_str(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown job kind {}", kind_str).into(),
        )
    })?;

    Ok(JobDefinition {
        id: row.get(0)?,
        symbol: row.get(1)?,
        symbol_id: row.get(2)?,
        timeframe,
        kind,
        window_days: row.get(5)?,
        priority: row.get(6)?,
        enabled: row.get::<_, i64>(7)? != 0,
        created_at: DateTime::from_timestamp(created_at, 0).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Integer,
                format!("created_at {} out of range", created_at).into(),
            )
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::bar_store::BarStore;
    use chrono::TimeZone;

    fn setup() -> (JobCatalog, BarStore) {
        let db = Db::open_memory().expect("open db");
        (JobCatalog::new(db.clone()), BarStore::new(db))
    }

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn upsert_is_keyed_by_symbol_timeframe_kind() {
        let (catalog, bars) = setup();
        let sid = bars.ensure_symbol("AAPL").unwrap();

        let id1 = catalog
            .upsert_definition("AAPL", sid, Timeframe::M15, JobKind::FetchIntraday, 7, 100, at(2024, 3, 1))
            .unwrap();
        let id2 = catalog
            .upsert_definition("AAPL", sid, Timeframe::M15, JobKind::FetchIntraday, 14, 300, at(2024, 3, 2))
            .unwrap();
        assert_eq!(id1, id2);

        let defs = catalog.list_enabled().unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].window_days, 14);
        assert_eq!(defs[0].priority, 300);
    }

    #[test]
    fn resubscribe_never_lowers_priority() {
        let (catalog, bars) = setup();
        let sid = bars.ensure_symbol("AAPL").unwrap();

        catalog
            .upsert_definition("AAPL", sid, Timeframe::H1, JobKind::FetchHistorical, 30, 300, at(2024, 3, 1))
            .unwrap();
        // A recent-search touch (priority 100) must not demote a watchlist entry.
        catalog
            .upsert_definition("AAPL", sid, Timeframe::H1, JobKind::FetchHistorical, 30, 100, at(2024, 3, 2))
            .unwrap();

        let defs = catalog.list_enabled().unwrap();
        assert_eq!(defs[0].priority, 300);
    }

    #[test]
    fn disabled_definitions_are_hidden_and_reenabled_on_upsert() {
        let (catalog, bars) = setup();
        let sid = bars.ensure_symbol("AAPL").unwrap();

        catalog
            .upsert_definition("AAPL", sid, Timeframe::H1, JobKind::FetchHistorical, 30, 200, at(2024, 3, 1))
            .unwrap();
        assert!(catalog
            .set_enabled("AAPL", Timeframe::H1, JobKind::FetchHistorical, false, at(2024, 3, 2))
            .unwrap());
        assert!(catalog.list_enabled().unwrap().is_empty());

        catalog
            .upsert_definition("AAPL", sid, Timeframe::H1, JobKind::FetchHistorical, 30, 200, at(2024, 3, 3))
            .unwrap();
        assert_eq!(catalog.list_enabled().unwrap().len(), 1);
    }

    #[test]
    fn list_orders_by_priority_then_age() {
        let (catalog, bars) = setup();
        let aapl = bars.ensure_symbol("AAPL").unwrap();
        let msft = bars.ensure_symbol("MSFT").unwrap();
        let nvda = bars.ensure_symbol("NVDA").unwrap();

        catalog
            .upsert_definition("MSFT", msft, Timeframe::H1, JobKind::FetchHistorical, 30, 100, at(2024, 3, 1))
            .unwrap();
        catalog
            .upsert_definition("AAPL", aapl, Timeframe::H1, JobKind::FetchHistorical, 30, 300, at(2024, 3, 2))
            .unwrap();
        catalog
            .upsert_definition("NVDA", nvda, Timeframe::H1, JobKind::FetchHistorical, 30, 300, at(2024, 3, 3))
            .unwrap();

        let symbols: Vec<String> = catalog
            .list_enabled()
            .unwrap()
            .into_iter()
            .map(|d| d.symbol)
            .collect();
        assert_eq!(symbols, vec!["AAPL", "NVDA", "MSFT"]);
    }
}
