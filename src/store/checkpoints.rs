//! Advisory resume pointers for long historical fetches.
//!
//! Read advisory only: a missing or stale checkpoint never blocks a fetch,
//! it just means the worker starts from the slice boundary instead.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::models::{ProviderId, Timeframe};
use crate::store::db::Db;

#[derive(Clone)]
pub struct ProviderCheckpoints {
    db: Db,
}

impl ProviderCheckpoints {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn get(
        &self,
        provider: ProviderId,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db.lock();
        let ts: Option<i64> = conn
            .query_row(
                "SELECT cursor_ts FROM provider_checkpoints
                 WHERE provider = ?1 AND symbol = ?2 AND timeframe = ?3",
                params![provider.as_str(), symbol, timeframe.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.and_then(|t| DateTime::from_timestamp(t, 0)))
    }

    pub fn put(
        &self,
        provider: ProviderId,
        symbol: &str,
        timeframe: Timeframe,
        cursor: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO provider_checkpoints (provider, symbol, timeframe, cursor_ts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(provider, symbol, timeframe) DO UPDATE SET
                cursor_ts = MAX(cursor_ts, excluded.cursor_ts),
                updated_at = excluded.updated_at",
            params![
                provider.as_str(),
                symbol,
                timeframe.as_str(),
                cursor.timestamp(),
                now.timestamp(),
            ],
        )?;
        Ok(())
    }
}
