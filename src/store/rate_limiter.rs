//! Distributed token buckets, one row per provider.
//!
//! Refill is lazy: every take first tops the bucket up by the minutes
//! elapsed since `updated_at`, capped at capacity, then tries to deduct the
//! cost. Acquisition is non-blocking; callers fall through to the next
//! provider or requeue.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::models::Config;
use crate::store::db::Db;

/// Default (capacity, refill per minute) per provider. Massive is the
/// legacy alias for polygon; finnhub has no bar adapter but its bucket is
/// kept so operator overrides stay meaningful.
const DEFAULT_BUCKETS: &[(&str, f64, f64)] = &[
    ("polygon", 5.0, 5.0),
    ("massive", 5.0, 5.0),
    ("tradier", 120.0, 120.0),
    ("yfinance", 2000.0, 2000.0),
    ("finnhub", 60.0, 60.0),
    ("alpaca", 200.0, 200.0),
];

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
    pub provider: String,
    pub capacity: f64,
    pub refill_per_minute: f64,
    /// Refill-projected token count at the query instant.
    pub tokens: f64,
    /// None when the bucket can never refill (refill rate 0).
    pub seconds_until_full: Option<f64>,
}

#[derive(Clone)]
pub struct RateLimiter {
    db: Db,
}

impl RateLimiter {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Seed missing bucket rows with defaults and apply env overrides.
    pub fn seed_defaults(&self, config: &Config, now: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock();
        for (provider, capacity, refill) in DEFAULT_BUCKETS {
            conn.execute(
                "INSERT OR IGNORE INTO rate_buckets
                    (provider, capacity, refill_per_minute, tokens, updated_at)
                 VALUES (?1, ?2, ?3, ?2, ?4)",
                params![provider, capacity, refill, now.timestamp()],
            )?;
        }
        drop(conn);

        if let Some(rpm) = config.finnhub_rpm_override {
            self.set_bucket("finnhub", rpm, rpm, now)?;
            info!(rpm, "⚙️  finnhub bucket overridden from environment");
        }
        if let Some(rpm) = config.massive_rpm_override {
            // Massive is the polygon alias; size both rows.
            self.set_bucket("massive", rpm, rpm, now)?;
            self.set_bucket("polygon", rpm, rpm, now)?;
            info!(rpm, "⚙️  massive/polygon buckets overridden from environment");
        }
        Ok(())
    }

    /// Resize a bucket, clamping stored tokens to the new capacity.
    pub fn set_bucket(
        &self,
        provider: &str,
        capacity: f64,
        refill_per_minute: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO rate_buckets (provider, capacity, refill_per_minute, tokens, updated_at)
             VALUES (?1, ?2, ?3, ?2, ?4)
             ON CONFLICT(provider) DO UPDATE SET
                capacity = excluded.capacity,
                refill_per_minute = excluded.refill_per_minute,
                tokens = MIN(tokens, excluded.capacity),
                updated_at = excluded.updated_at",
            params![provider, capacity, refill_per_minute, now.timestamp()],
        )
        .context("bucket resize failed")?;
        Ok(())
    }

    /// Try to take `cost` tokens. Refill is applied first either way, and
    /// `updated_at` always advances so elapsed time is never counted twice.
    pub fn take(&self, provider: &str, cost: f64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<bool> {
            let row: Option<(f64, f64, f64, i64)> = conn
                .query_row(
                    "SELECT capacity, refill_per_minute, tokens, updated_at
                     FROM rate_buckets WHERE provider = ?1",
                    params![provider],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            let Some((capacity, refill, tokens, updated_at)) = row else {
                // No accounting row means no limit is configured.
                debug!(provider, "rate bucket missing; allowing request");
                return Ok(true);
            };

            let elapsed_minutes = ((now.timestamp() - updated_at).max(0)) as f64 / 60.0;
            let refilled = (tokens + elapsed_minutes * refill).min(capacity);
            let granted = refilled >= cost;
            let remaining = if granted { refilled - cost } else { refilled };

            conn.execute(
                "UPDATE rate_buckets SET tokens = ?1, updated_at = ?2 WHERE provider = ?3",
                params![remaining, now.timestamp(), provider],
            )?;
            Ok(granted)
        })();

        match result {
            Ok(granted) => {
                conn.execute("COMMIT", [])?;
                Ok(granted)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e).context("rate bucket take failed")
            }
        }
    }

    /// Projected state without mutating the row. Diagnostics only.
    pub fn get_status(&self, provider: &str, now: DateTime<Utc>) -> Result<Option<BucketStatus>> {
        let conn = self.db.lock();
        let row: Option<(f64, f64, f64, i64)> = conn
            .query_row(
                "SELECT capacity, refill_per_minute, tokens, updated_at
                 FROM rate_buckets WHERE provider = ?1",
                params![provider],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        Ok(row.map(|(capacity, refill, tokens, updated_at)| {
            project(provider, capacity, refill, tokens, updated_at, now)
        }))
    }

    pub fn list_status(&self, now: DateTime<Utc>) -> Result<Vec<BucketStatus>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT provider, capacity, refill_per_minute, tokens, updated_at
             FROM rate_buckets ORDER BY provider",
        )?;
        let statuses = stmt
            .query_map([], |row| {
                let provider: String = row.get(0)?;
                let capacity: f64 = row.get(1)?;
                let refill: f64 = row.get(2)?;
                let tokens: f64 = row.get(3)?;
                let updated_at: i64 = row.get(4)?;
                Ok(project(&provider, capacity, refill, tokens, updated_at, now))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(statuses)
    }
}

fn project(
    provider: &str,
    capacity: f64,
    refill: f64,
    tokens: f64,
    updated_at: i64,
    now: DateTime<Utc>,
) -> BucketStatus {
    let elapsed_minutes = ((now.timestamp() - updated_at).max(0)) as f64 / 60.0;
    let projected = (tokens + elapsed_minutes * refill).min(capacity);
    let seconds_until_full = if projected >= capacity {
        Some(0.0)
    } else if refill > 0.0 {
        Some((capacity - projected) / refill * 60.0)
    } else {
        None
    };
    BucketStatus {
        provider: provider.to_string(),
        capacity,
        refill_per_minute: refill,
        tokens: projected,
        seconds_until_full,
    }
}
