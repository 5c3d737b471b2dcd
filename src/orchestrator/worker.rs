//! Worker execution: claim one run, acquire a provider token, fetch,
//! validate, upsert, update coverage, and write the terminal state.
//!
//! Provider fallback walks the router's preference order. Only rate-limit
//! and transient failures advance to the next provider; auth and permanent
//! failures fail the run outright. When every candidate is exhausted the
//! run goes back to queued (next tick retries it) until the attempt cap.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::clock::{market_day_et, now_utc};
use crate::models::{fixed4_from_f64, Bar, DataStatus, RunStatus};
use crate::providers::{route_candidates, BarBatch, ProviderError};
use crate::state::AppState;
use crate::store::ClaimedRun;

/// Claim and execute at most one run. Returns whether a run was executed.
pub async fn run_one_worker(state: &AppState) -> Result<bool> {
    let now = now_utc();
    let Some(run) = state.queue.claim_next(None, now)? else {
        return Ok(false);
    };
    execute_run(state, run, now).await?;
    Ok(true)
}

/// Execute a claimed run to a terminal state (or back to queued).
pub async fn execute_run(state: &AppState, run: ClaimedRun, now: DateTime<Utc>) -> Result<()> {
    let candidates = route_candidates(run.kind);
    if candidates.is_empty() {
        state.queue.complete(
            &run.id,
            RunStatus::Failed,
            0,
            None,
            Some(("no_provider", "no provider routes this job kind")),
            now,
        )?;
        return Ok(());
    }

    let mut exhausted_retryable = false;
    let mut last_error: Option<ProviderError> = None;

    for provider in candidates {
        let Some(adapter) = state.providers.get(*provider) else {
            continue; // not configured; skip silently
        };

        if !state.rate.take(provider.as_str(), 1.0, now)? {
            exhausted_retryable = true;
            last_error = Some(ProviderError::RateLimited { retry_after: None });
            continue;
        }

        match adapter
            .fetch_bars(&run.symbol, run.timeframe, run.slice.from, run.slice.to)
            .await
        {
            Ok(batch) => {
                // Batch boundary: honor administrative cancellation before
                // touching the store.
                if state.queue.is_cancelled(&run.id)? {
                    info!(run_id = %run.id, "run cancelled; dropping fetched batch");
                    return Ok(());
                }

                let bars = batch_to_bars(batch, &run, now);
                let report = state.bars.upsert_bars(&bars, now)?;
                let rows = report.written as i64;

                let note = if report.rejected.is_empty() {
                    None
                } else {
                    Some((
                        "validation_dropped",
                        format!("{} rows violated layer invariants", report.rejected.len()),
                    ))
                };
                state.queue.complete(
                    &run.id,
                    RunStatus::Success,
                    rows,
                    Some(*provider),
                    note.as_ref().map(|(c, m)| (*c, m.as_str())),
                    now,
                )?;

                if rows > 0 {
                    state.coverage.record_success(
                        &run.symbol,
                        run.timeframe,
                        run.slice.from,
                        run.slice.to,
                        rows,
                        *provider,
                        now,
                    )?;
                    state
                        .checkpoints
                        .put(*provider, &run.symbol, run.timeframe, run.slice.to, now)?;
                }

                info!(
                    run_id = %run.id,
                    symbol = %run.symbol,
                    timeframe = run.timeframe.as_str(),
                    provider = provider.as_str(),
                    rows,
                    "✅ Run complete"
                );
                return Ok(());
            }
            Err(ProviderError::NotFound) => {
                // Empty response: the run succeeds with zero rows and
                // coverage is not advanced.
                state.queue.complete(
                    &run.id,
                    RunStatus::Success,
                    0,
                    Some(*provider),
                    Some(("not_found", "provider returned no data for the slice")),
                    now,
                )?;
                info!(
                    run_id = %run.id,
                    symbol = %run.symbol,
                    provider = provider.as_str(),
                    "run complete with empty result"
                );
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                warn!(
                    run_id = %run.id,
                    provider = provider.as_str(),
                    error = %e,
                    "provider failed; advancing to next candidate"
                );
                exhausted_retryable = true;
                last_error = Some(e);
                continue;
            }
            Err(e) => {
                warn!(
                    run_id = %run.id,
                    provider = provider.as_str(),
                    error = %e,
                    "🛑 Run failed permanently"
                );
                state.queue.complete(
                    &run.id,
                    RunStatus::Failed,
                    0,
                    Some(*provider),
                    Some((e.code(), &e.to_string())),
                    now,
                )?;
                return Ok(());
            }
        }
    }

    // Every candidate was rate limited, transient, or unconfigured.
    let reason = last_error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no configured provider for this kind".to_string());

    if exhausted_retryable && run.attempt < i64::from(state.config.max_attempts) {
        // Next tick picks the run back up; that spacing is the backoff.
        state.queue.requeue(&run.id, &reason)?;
    } else {
        let code = last_error.as_ref().map(|e| e.code()).unwrap_or("no_provider");
        state.queue.complete(
            &run.id,
            RunStatus::Failed,
            0,
            None,
            Some((code, &reason)),
            now,
        )?;
        warn!(run_id = %run.id, attempts = run.attempt, reason = %reason, "run failed after exhausting providers");
    }
    Ok(())
}

/// Normalize a provider batch into store rows: 4-decimal fixed-point
/// prices, truthful intraday flag for today's Eastern session, and a
/// data-status snapshot.
fn batch_to_bars(batch: BarBatch, run: &ClaimedRun, now: DateTime<Utc>) -> Vec<Bar> {
    let today_et = market_day_et(now);
    batch
        .bars
        .into_iter()
        .map(|pb| {
            let intraday = market_day_et(pb.ts) == today_et;
            Bar {
                symbol: run.symbol.clone(),
                timeframe: run.timeframe,
                ts: pb.ts,
                open: fixed4_from_f64(pb.open),
                high: fixed4_from_f64(pb.high),
                low: fixed4_from_f64(pb.low),
                close: fixed4_from_f64(pb.close),
                volume: pb.volume,
                provider: batch.provider,
                is_intraday: intraday,
                is_forecast: false,
                data_status: if intraday {
                    DataStatus::Live
                } else {
                    DataStatus::Verified
                },
                confidence_score: None,
                upper_band: None,
                lower_band: None,
                fetched_at: now,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Config, JobKind, ProviderId, Slice, Timeframe};
    use crate::providers::{MarketDataProvider, ProviderBar, ProviderSet};
    use crate::store::Db;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Scripted adapter: pops one response per fetch call.
    struct MockProvider {
        id: ProviderId,
        script: Mutex<Vec<Result<Vec<ProviderBar>, ProviderError>>>,
        calls: Mutex<usize>,
    }

    impl MockProvider {
        fn new(id: ProviderId, script: Vec<Result<Vec<ProviderBar>, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                id,
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl MarketDataProvider for MockProvider {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn fetch_bars(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<BarBatch, ProviderError> {
            *self.calls.lock() += 1;
            let mut script = self.script.lock();
            if script.is_empty() {
                return Err(ProviderError::Transient("script exhausted".into()));
            }
            script.remove(0).map(|bars| BarBatch {
                provider: self.id,
                bars,
            })
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn sample_bars() -> Vec<ProviderBar> {
        vec![ProviderBar {
            ts: at(2024, 3, 1, 10, 0),
            open: 170.1234,
            high: 171.0,
            low: 169.5,
            close: 170.5678,
            volume: 1000,
        }]
    }

    fn state_with(providers: ProviderSet) -> AppState {
        let db = Db::open_memory().expect("open db");
        AppState::new(Config::from_env(), db, providers)
    }

    async fn enqueue_and_claim(state: &AppState, kind: JobKind) -> ClaimedRun {
        let now = at(2024, 3, 6, 15, 0);
        let slice = Slice {
            from: at(2024, 3, 1, 0, 0),
            to: at(2024, 3, 2, 0, 0),
        };
        let sid = state.bars.ensure_symbol("AAPL").unwrap();
        let def_id = state
            .catalog
            .upsert_definition("AAPL", sid, Timeframe::M15, kind, 7, 300, now)
            .unwrap();
        state
            .queue
            .enqueue_slices(def_id, "AAPL", Timeframe::M15, kind, &[slice], "cron", now)
            .await
            .unwrap();
        state.queue.claim_next(None, now).unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_writes_bars_and_coverage() {
        let alpaca = MockProvider::new(ProviderId::Alpaca, vec![Ok(sample_bars())]);
        let state = state_with(ProviderSet::with_adapters(vec![alpaca.clone()]));
        let run = enqueue_and_claim(&state, JobKind::FetchHistorical).await;
        let now = at(2024, 3, 6, 15, 0);

        execute_run(&state, run.clone(), now).await.unwrap();

        let record = state.queue.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.rows_written, 1);
        assert_eq!(record.provider.as_deref(), Some("alpaca"));

        let cov = state.coverage.get("AAPL", Timeframe::M15).unwrap().unwrap();
        assert_eq!(cov.from_ts, run.slice.from);
        assert_eq!(cov.to_ts, run.slice.to);
        assert_eq!(cov.last_provider, "alpaca");

        // Price rounding happened on the way in.
        let chart = state
            .bars
            .read_chart("AAPL", Timeframe::M15, 10, false, now)
            .unwrap();
        assert_eq!(chart.bars[0].open, 1_701_234);
        assert_eq!(chart.bars[0].close, 1_705_678);
    }

    #[tokio::test]
    async fn rate_limited_everywhere_requeues_then_succeeds_after_refill() {
        let alpaca = MockProvider::new(ProviderId::Alpaca, vec![Ok(sample_bars())]);
        let tradier = MockProvider::new(ProviderId::Tradier, vec![]);
        let state = state_with(ProviderSet::with_adapters(vec![alpaca.clone(), tradier]));
        let now = at(2024, 3, 6, 15, 0);
        state.rate.set_bucket("alpaca", 0.0, 0.0, now).unwrap();
        state.rate.set_bucket("tradier", 0.0, 0.0, now).unwrap();

        let run = enqueue_and_claim(&state, JobKind::FetchIntraday).await;
        execute_run(&state, run.clone(), now).await.unwrap();

        // No provider was even called; the run went back to queued.
        assert_eq!(alpaca.calls(), 0);
        let record = state.queue.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Queued);
        assert_eq!(record.attempt, 2);

        // A minute later the bucket refilled and the retry succeeds.
        let later = at(2024, 3, 6, 15, 1);
        state.rate.set_bucket("alpaca", 5.0, 5.0, later).unwrap();
        let retry = state.queue.claim_next(None, later).unwrap().unwrap();
        execute_run(&state, retry.clone(), later).await.unwrap();
        let record = state.queue.get_run(&retry.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
    }

    #[tokio::test]
    async fn transient_failure_falls_through_to_next_provider() {
        let alpaca = MockProvider::new(
            ProviderId::Alpaca,
            vec![Err(ProviderError::Transient("502".into()))],
        );
        let polygon = MockProvider::new(ProviderId::Polygon, vec![Ok(sample_bars())]);
        let state = state_with(ProviderSet::with_adapters(vec![alpaca.clone(), polygon.clone()]));
        let run = enqueue_and_claim(&state, JobKind::FetchHistorical).await;
        let now = at(2024, 3, 6, 15, 0);

        execute_run(&state, run.clone(), now).await.unwrap();

        assert_eq!(alpaca.calls(), 1);
        assert_eq!(polygon.calls(), 1);
        let record = state.queue.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.provider.as_deref(), Some("polygon"));
    }

    #[tokio::test]
    async fn auth_error_fails_without_fallback() {
        let alpaca = MockProvider::new(
            ProviderId::Alpaca,
            vec![Err(ProviderError::Auth("bad key".into()))],
        );
        let polygon = MockProvider::new(ProviderId::Polygon, vec![Ok(sample_bars())]);
        let state = state_with(ProviderSet::with_adapters(vec![alpaca, polygon.clone()]));
        let run = enqueue_and_claim(&state, JobKind::FetchHistorical).await;
        let now = at(2024, 3, 6, 15, 0);

        execute_run(&state, run.clone(), now).await.unwrap();

        assert_eq!(polygon.calls(), 0);
        let record = state.queue.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error_code.as_deref(), Some("auth_error"));
    }

    #[tokio::test]
    async fn not_found_succeeds_with_zero_rows() {
        let alpaca = MockProvider::new(ProviderId::Alpaca, vec![Err(ProviderError::NotFound)]);
        let state = state_with(ProviderSet::with_adapters(vec![alpaca]));
        let run = enqueue_and_claim(&state, JobKind::FetchHistorical).await;
        let now = at(2024, 3, 6, 15, 0);

        execute_run(&state, run.clone(), now).await.unwrap();

        let record = state.queue.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.rows_written, 0);
        // Coverage was not advanced.
        assert!(state.coverage.get("AAPL", Timeframe::M15).unwrap().is_none());
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally() {
        let alpaca = MockProvider::new(
            ProviderId::Alpaca,
            vec![Err(ProviderError::Transient("down".into()))],
        );
        let state = state_with(ProviderSet::with_adapters(vec![alpaca]));
        let mut run = enqueue_and_claim(&state, JobKind::FetchHistorical).await;
        run.attempt = i64::from(state.config.max_attempts);
        let now = at(2024, 3, 6, 15, 0);

        execute_run(&state, run.clone(), now).await.unwrap();

        let record = state.queue.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error_code.as_deref(), Some("transient"));
    }

    #[tokio::test]
    async fn cancellation_is_honored_at_the_batch_boundary() {
        let alpaca = MockProvider::new(ProviderId::Alpaca, vec![Ok(sample_bars())]);
        let state = state_with(ProviderSet::with_adapters(vec![alpaca]));
        let run = enqueue_and_claim(&state, JobKind::FetchHistorical).await;
        let now = at(2024, 3, 6, 15, 0);

        state.queue.cancel(&run.id, now).unwrap();
        execute_run(&state, run.clone(), now).await.unwrap();

        let record = state.queue.get_run(&run.id).unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
        // Nothing was written.
        let chart = state
            .bars
            .read_chart("AAPL", Timeframe::M15, 10, false, now)
            .unwrap();
        assert!(chart.bars.is_empty());
    }
}
