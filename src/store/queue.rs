//! Durable slice-level job queue.
//!
//! Enqueue is idempotent: a slice whose identity hash already exists in
//! {queued, running, success} is skipped, and enqueuers for the same
//! (symbol, timeframe) serialize on a keyed advisory lock so concurrent
//! triggers observe each other's inserts. Claims are atomic: the oldest
//! queued run transitions to running inside one immediate transaction, so
//! at most one worker ever observes a given run.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{JobKind, ProviderId, RunStatus, Slice, Timeframe};
use crate::store::db::Db;

/// Slice identity digest: symbol, timeframe and the unix-second bounds.
pub fn slice_hash(symbol: &str, timeframe: Timeframe, slice: &Slice) -> String {
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{}|{}|{}|{}",
            symbol,
            timeframe.as_str(),
            slice.from.timestamp(),
            slice.to.timestamp()
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

fn enqueue_lock_key(symbol: &str, timeframe: Timeframe) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}", symbol, timeframe.as_str()).as_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

/// A run handed to exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedRun {
    pub id: String,
    pub job_def_id: i64,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub kind: JobKind,
    pub slice: Slice,
    pub attempt: i64,
    pub triggered_by: String,
}

/// Full run row, used by diagnostics and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub kind: JobKind,
    pub slice: Slice,
    pub status: RunStatus,
    pub attempt: i64,
    pub rows_written: i64,
    pub provider: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub triggered_by: String,
    pub idx_hash: String,
}

type GuardMap = HashMap<u64, Arc<AsyncMutex<()>>>;

#[derive(Clone)]
pub struct JobQueue {
    db: Db,
    enqueue_guards: Arc<SyncMutex<GuardMap>>,
}

impl JobQueue {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            enqueue_guards: Arc::new(SyncMutex::new(HashMap::new())),
        }
    }

    fn guard_for(&self, key: u64) -> Arc<AsyncMutex<()>> {
        let mut guards = self.enqueue_guards.lock();
        guards.entry(key).or_default().clone()
    }

    /// Insert queued runs for the slices that are not already pending or
    /// done. Returns the number of newly created rows.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue_slices(
        &self,
        job_def_id: i64,
        symbol: &str,
        timeframe: Timeframe,
        kind: JobKind,
        slices: &[Slice],
        triggered_by: &str,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        if slices.is_empty() {
            return Ok(0);
        }

        // Serialize enqueuers for this (symbol, timeframe) so dedup checks
        // observe each other's inserts.
        let guard = self.guard_for(enqueue_lock_key(symbol, timeframe));
        let _held = guard.lock().await;

        let conn = self.db.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<usize> {
            let mut inserted = 0usize;
            for slice in slices {
                let hash = slice_hash(symbol, timeframe, slice);
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM job_runs
                     WHERE idx_hash = ?1 AND status IN ('queued', 'running', 'success')",
                    params![hash],
                    |row| row.get(0),
                )?;
                if exists > 0 {
                    continue;
                }

                let seq: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM job_runs",
                    [],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO job_runs
                        (id, job_def_id, symbol, timeframe, kind, slice_from, slice_to,
                         status, attempt, progress_pct, rows_written, triggered_by,
                         idx_hash, seq, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'queued', 1, 0, 0, ?8, ?9, ?10, ?11)",
                    params![
                        Uuid::new_v4().to_string(),
                        job_def_id,
                        symbol,
                        timeframe.as_str(),
                        kind.as_str(),
                        slice.from.timestamp(),
                        slice.to.timestamp(),
                        triggered_by,
                        hash,
                        seq,
                        now.timestamp(),
                    ],
                )?;
                inserted += 1;
            }
            Ok(inserted)
        })();

        match result {
            Ok(inserted) => {
                conn.execute("COMMIT", [])?;
                Ok(inserted)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e).context("enqueue transaction failed")
            }
        }
    }

    /// Atomically claim the oldest queued run, optionally filtered by kind.
    /// Returns `None` without side effects when nothing is queued.
    pub fn claim_next(
        &self,
        kind: Option<JobKind>,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRun>> {
        let conn = self.db.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let candidate = (|| -> Result<Option<ClaimedRun>> {
            let row = match kind {
                Some(k) => conn
                    .query_row(
                        "SELECT id, job_def_id, symbol, timeframe, kind, slice_from, slice_to,
                                attempt, triggered_by
                         FROM job_runs
                         WHERE status = 'queued' AND kind = ?1
                         ORDER BY created_at ASC, seq ASC
                         LIMIT 1",
                        params![k.as_str()],
                        row_to_claim,
                    )
                    .optional()?,
                None => conn
                    .query_row(
                        "SELECT id, job_def_id, symbol, timeframe, kind, slice_from, slice_to,
                                attempt, triggered_by
                         FROM job_runs
                         WHERE status = 'queued'
                         ORDER BY created_at ASC, seq ASC
                         LIMIT 1",
                        [],
                        row_to_claim,
                    )
                    .optional()?,
            };

            let Some(run) = row else {
                return Ok(None);
            };

            let changed = conn.execute(
                "UPDATE job_runs SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![now.timestamp(), run.id],
            )?;
            if changed == 1 {
                Ok(Some(run))
            } else {
                Ok(None)
            }
        })();

        match candidate {
            Ok(run) => {
                conn.execute("COMMIT", [])?;
                Ok(run)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e).context("claim transaction failed")
            }
        }
    }

    /// Terminal transition for a running run. Returns false if the run was
    /// not in `running` (for example cancelled underneath the worker).
    pub fn complete(
        &self,
        run_id: &str,
        status: RunStatus,
        rows_written: i64,
        provider: Option<ProviderId>,
        error: Option<(&str, &str)>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        debug_assert!(matches!(status, RunStatus::Success | RunStatus::Failed));
        let (error_code, error_message) = match error {
            Some((code, msg)) => (Some(code), Some(msg)),
            None => (None, None),
        };
        let progress = if status == RunStatus::Success { 100 } else { 0 };

        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE job_runs
             SET status = ?1, rows_written = ?2, provider = ?3,
                 error_code = ?4, error_message = ?5,
                 progress_pct = ?6, finished_at = ?7
             WHERE id = ?8 AND status = 'running'",
            params![
                status.as_str(),
                rows_written,
                provider.map(|p| p.as_str()),
                error_code,
                error_message,
                progress,
                now.timestamp(),
                run_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Push a running or failed run back to queued for another attempt.
    pub fn requeue(&self, run_id: &str, reason: &str) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE job_runs
             SET status = 'queued', attempt = attempt + 1,
                 started_at = NULL, finished_at = NULL,
                 error_code = 'requeued', error_message = ?1
             WHERE id = ?2 AND status IN ('running', 'failed')",
            params![reason, run_id],
        )?;
        if changed > 0 {
            info!(run_id, reason, "🔁 Run requeued");
        }
        Ok(changed > 0)
    }

    /// Administrative cancel. Only queued or running runs can be cancelled.
    pub fn cancel(&self, run_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE job_runs
             SET status = 'cancelled', finished_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'running')",
            params![now.timestamp(), run_id],
        )?;
        Ok(changed > 0)
    }

    /// Cancel flag checked by workers at batch boundaries.
    pub fn is_cancelled(&self, run_id: &str) -> Result<bool> {
        let conn = self.db.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM job_runs WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref() == Some("cancelled"))
    }

    /// Fail runs stuck in `running` beyond the timeout. Runs inside the
    /// window are never touched.
    pub fn sweep_stuck(&self, timeout_secs: i64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - Duration::seconds(timeout_secs)).timestamp();
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE job_runs
             SET status = 'failed', error_code = 'stuck',
                 error_message = 'exceeded running timeout', finished_at = ?1
             WHERE status = 'running' AND started_at < ?2",
            params![now.timestamp(), cutoff],
        )?;
        if changed > 0 {
            warn!(swept = changed, "🧹 Marked stuck runs as failed");
        }
        Ok(changed)
    }

    /// Delete terminal runs older than the retention window.
    pub fn prune_terminal(&self, retention_days: i64, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - Duration::days(retention_days)).timestamp();
        let conn = self.db.lock();
        let deleted = conn.execute(
            "DELETE FROM job_runs
             WHERE status IN ('success', 'failed', 'cancelled') AND finished_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    pub fn counts_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT status, COUNT(*) FROM job_runs GROUP BY status ORDER BY status",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    pub fn queued_count(&self) -> Result<i64> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_runs WHERE status = 'queued'",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, timeframe, kind, slice_from, slice_to, status, attempt,
                    rows_written, provider, error_code, error_message, triggered_by, idx_hash
             FROM job_runs WHERE id = ?1",
        )?;
        let record = stmt.query_row(params![run_id], row_to_record).optional()?;
        Ok(record)
    }

    /// Count of runs sharing an idempotency hash in the given statuses.
    pub fn count_by_hash(&self, idx_hash: &str) -> Result<i64> {
        let conn = self.db.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_runs WHERE idx_hash = ?1",
            params![idx_hash],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn parse_timeframe(s: &str, col: usize) -> rusqlite::Result<Timeframe> {
    Timeframe::parse_str(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown timeframe {}", s).into(),
        )
    })
}

fn parse_kind(s: &str, col: usize) -> rusqlite::Result<JobKind> {
    JobKind::parse_str(s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Text,
            format!("unknown job kind {}", s).into(),
        )
    })
}

fn dt_col(ts: i64, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            col,
            rusqlite::types::Type::Integer,
            format!("timestamp {} out of range", ts).into(),
        )
    })
}

fn row_to_claim(row: &rusqlite::Row) -> rusqlite::Result<ClaimedRun> {
    let timeframe: String = row.get(3)?;
    let kind: String = row.get(4)?;
    let slice_from: i64 = row.get(5)?;
    let slice_to: i64 = row.get(6)?;
    Ok(ClaimedRun {
        id: row.get(0)?,
        job_def_id: row.get(1)?,
        symbol: row.get(2)?,
        timeframe: parse_timeframe(&timeframe, 3)?,
        kind: parse_kind(&kind, 4)?,
        slice: Slice {
            from: dt_col(slice_from, 5)?,
            to: dt_col(slice_to, 6)?,
        },
        attempt: row.get(7)?,
        triggered_by: row.get(8)?,
    })
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
    let timeframe: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let slice_from: i64 = row.get(4)?;
    let slice_to: i64 = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(RunRecord {
        id: row.get(0)?,
        symbol: row.get(1)?,
        timeframe: parse_timeframe(&timeframe, 2)?,
        kind: parse_kind(&kind, 3)?,
        slice: Slice {
            from: dt_col(slice_from, 4)?,
            to: dt_col(slice_to, 5)?,
        },
        status: RunStatus::parse_str(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                format!("unknown status {}", status).into(),
            )
        })?,
        attempt: row.get(7)?,
        rows_written: row.get(8)?,
        provider: row.get(9)?,
        error_code: row.get(10)?,
        error_message: row.get(11)?,
        triggered_by: row.get(12)?,
        idx_hash: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::bar_store::BarStore;
    use crate::store::catalog::JobCatalog;
    use chrono::TimeZone;

    /// Queue over a store seeded with two definitions (ids 1 and 2) so the
    /// run rows have real parents.
    fn queue() -> JobQueue {
        let db = Db::open_memory().expect("open db");
        let sid = BarStore::new(db.clone()).ensure_symbol("AAPL").expect("symbol");
        let catalog = JobCatalog::new(db.clone());
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        catalog
            .upsert_definition("AAPL", sid, Timeframe::M15, JobKind::FetchIntraday, 7, 300, created)
            .expect("def 1");
        catalog
            .upsert_definition("AAPL", sid, Timeframe::D1, JobKind::FetchHistorical, 365, 300, created)
            .expect("def 2");
        JobQueue::new(db)
    }

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    fn day_slice(d: u32) -> Slice {
        Slice {
            from: at(2024, 3, d, 0),
            to: at(2024, 3, d + 1, 0),
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        let slices = [day_slice(1), day_slice(2)];

        let first = q
            .enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &slices, "cron", now)
            .await
            .unwrap();
        assert_eq!(first, 2);

        let second = q
            .enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &slices, "cron", now)
            .await
            .unwrap();
        assert_eq!(second, 0);

        let hash = slice_hash("AAPL", Timeframe::M15, &day_slice(1));
        assert_eq!(q.count_by_hash(&hash).unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_is_oldest_first_and_exclusive() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &[day_slice(1), day_slice(2)], "cron", now)
            .await
            .unwrap();

        let first = q.claim_next(None, now).unwrap().unwrap();
        assert_eq!(first.slice, day_slice(1));

        let second = q.claim_next(None, now).unwrap().unwrap();
        assert_eq!(second.slice, day_slice(2));
        assert_ne!(first.id, second.id);

        assert!(q.claim_next(None, now).unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_filters_by_kind() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &[day_slice(1)], "cron", now)
            .await
            .unwrap();
        q.enqueue_slices(2, "AAPL", Timeframe::D1, JobKind::FetchHistorical, &[day_slice(2)], "cron", now)
            .await
            .unwrap();

        let claimed = q
            .claim_next(Some(JobKind::FetchHistorical), now)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.kind, JobKind::FetchHistorical);
    }

    #[test]
    fn claim_on_empty_queue_returns_none() {
        let q = queue();
        assert!(q.claim_next(None, at(2024, 3, 6, 15)).unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_success_is_terminal() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &[day_slice(1)], "cron", now)
            .await
            .unwrap();
        let run = q.claim_next(None, now).unwrap().unwrap();

        assert!(q
            .complete(&run.id, RunStatus::Success, 42, Some(ProviderId::Alpaca), None, now)
            .unwrap());
        let record = q.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.rows_written, 42);
        assert_eq!(record.provider.as_deref(), Some("alpaca"));

        // Already terminal: a second completion is a no-op.
        assert!(!q
            .complete(&run.id, RunStatus::Failed, 0, None, Some(("late", "late")), now)
            .unwrap());
    }

    #[tokio::test]
    async fn success_blocks_reenqueue_but_failed_does_not() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        let slices = [day_slice(1)];
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &slices, "cron", now)
            .await
            .unwrap();
        let run = q.claim_next(None, now).unwrap().unwrap();
        q.complete(&run.id, RunStatus::Failed, 0, None, Some(("transient", "timeout")), now)
            .unwrap();

        // Failed runs do not participate in dedup, so the slice can be retried
        // with a fresh row.
        let inserted = q
            .enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &slices, "cron", now)
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        let retry = q.claim_next(None, now).unwrap().unwrap();
        q.complete(&retry.id, RunStatus::Success, 10, Some(ProviderId::Alpaca), None, now)
            .unwrap();

        // Success does participate: no further rows for this hash.
        let inserted = q
            .enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &slices, "cron", now)
            .await
            .unwrap();
        assert_eq!(inserted, 0);
    }

    #[tokio::test]
    async fn requeue_increments_attempt() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &[day_slice(1)], "cron", now)
            .await
            .unwrap();
        let run = q.claim_next(None, now).unwrap().unwrap();
        assert_eq!(run.attempt, 1);

        assert!(q.requeue(&run.id, "all providers rate limited").unwrap());
        let retry = q.claim_next(None, now).unwrap().unwrap();
        assert_eq!(retry.id, run.id);
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn cancel_stops_the_run() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &[day_slice(1)], "cron", now)
            .await
            .unwrap();
        let run = q.claim_next(None, now).unwrap().unwrap();

        assert!(q.cancel(&run.id, now).unwrap());
        assert!(q.is_cancelled(&run.id).unwrap());
        // A cancelled run cannot be completed.
        assert!(!q
            .complete(&run.id, RunStatus::Success, 5, Some(ProviderId::Alpaca), None, now)
            .unwrap());
    }

    #[tokio::test]
    async fn stuck_sweep_respects_the_window() {
        let q = queue();
        let started = at(2024, 3, 6, 15);
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &[day_slice(1)], "cron", started)
            .await
            .unwrap();
        let run = q.claim_next(None, started).unwrap().unwrap();

        // Inside the timeout: untouched.
        assert_eq!(q.sweep_stuck(600, started + Duration::seconds(300)).unwrap(), 0);
        // Past the timeout: failed.
        assert_eq!(q.sweep_stuck(600, started + Duration::seconds(700)).unwrap(), 1);
        let record = q.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error_code.as_deref(), Some("stuck"));
    }

    #[tokio::test]
    async fn prune_deletes_only_old_terminal_runs() {
        let q = queue();
        let now = at(2024, 3, 6, 15);
        q.enqueue_slices(1, "AAPL", Timeframe::M15, JobKind::FetchIntraday, &[day_slice(1), day_slice(2)], "cron", now)
            .await
            .unwrap();
        let run = q.claim_next(None, now).unwrap().unwrap();
        q.complete(&run.id, RunStatus::Success, 3, Some(ProviderId::Alpaca), None, now)
            .unwrap();

        // Too young to prune.
        assert_eq!(q.prune_terminal(14, now + Duration::days(1)).unwrap(), 0);
        // Old enough; the queued sibling survives.
        assert_eq!(q.prune_terminal(14, now + Duration::days(15)).unwrap(), 1);
        assert_eq!(q.queued_count().unwrap(), 1);
    }
}
