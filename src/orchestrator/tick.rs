//! The orchestrator tick: derive missing coverage, enqueue slices, dispatch
//! workers.
//!
//! Higher-priority definitions are fully enqueued before lower ones within
//! a tick, and slices within a definition go in oldest-first. Slice bounds
//! are aligned to the UTC day grid so repeated ticks at the same minute
//! produce identical idempotency hashes and dedup away.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::align_slice_end;
use crate::models::{JobKind, Slice, Timeframe};
use crate::orchestrator::worker::run_one_worker;
use crate::state::AppState;

#[derive(Debug, Default, Clone, Serialize)]
pub struct TickSummary {
    pub defs_scanned: usize,
    pub slices_enqueued: usize,
    /// Workers that claimed and executed a run this tick.
    pub workers_dispatched: usize,
}

/// One coordinator pass. Sequential over definitions; the dispatched
/// workers run concurrently with bounded parallelism.
pub async fn run_tick(state: &AppState, now: DateTime<Utc>) -> Result<TickSummary> {
    let mut summary = TickSummary::default();

    let defs = state.catalog.list_enabled()?;
    for def in &defs {
        summary.defs_scanned += 1;
        if def.kind == JobKind::RunForecast {
            // Forecast rows come from the external ML pipeline; nothing to
            // fetch here.
            continue;
        }

        let end = align_slice_end(now, def.timeframe);
        let gaps = state
            .coverage
            .gaps(&def.symbol, def.timeframe, def.window_days, now)?;

        for gap in gaps {
            let capped = Slice {
                from: gap.from,
                to: gap.to.min(end),
            };
            if capped.to <= capped.from {
                continue;
            }
            let slices = split_gap_into_slices(capped, def.timeframe);
            if slices.is_empty() {
                continue;
            }
            let inserted = state
                .queue
                .enqueue_slices(
                    def.id,
                    &def.symbol,
                    def.timeframe,
                    def.kind,
                    &slices,
                    "cron",
                    now,
                )
                .await?;
            summary.slices_enqueued += inserted;
            if inserted > 0 {
                debug!(
                    symbol = %def.symbol,
                    timeframe = def.timeframe.as_str(),
                    inserted,
                    "enqueued gap slices"
                );
            }
        }
    }

    // Dispatch up to MAX_CONCURRENT workers; each attempts one claim and
    // returns immediately when the queue is empty.
    let mut handles = Vec::with_capacity(state.config.max_concurrent_workers);
    for _ in 0..state.config.max_concurrent_workers {
        let worker_state = state.clone();
        handles.push(tokio::spawn(async move {
            run_one_worker(&worker_state).await
        }));
    }
    for handle in handles {
        match handle.await {
            Ok(Ok(true)) => summary.workers_dispatched += 1,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(error = %e, "worker failed"),
            Err(e) => warn!(error = %e, "worker join error"),
        }
    }

    info!(
        defs_scanned = summary.defs_scanned,
        slices_enqueued = summary.slices_enqueued,
        workers_dispatched = summary.workers_dispatched,
        "⏱️  Orchestrator tick complete"
    );
    Ok(summary)
}

/// Enqueue refresh slices for one symbol/timeframe outside the cron path
/// (chart views and manual triggers). Ensures a definition exists so the
/// cron tick keeps the symbol fresh afterwards.
pub async fn enqueue_symbol_refresh(
    state: &AppState,
    symbol: &str,
    timeframe: Timeframe,
    priority: i64,
    triggered_by: &str,
    now: DateTime<Utc>,
) -> Result<usize> {
    let symbol_id = state.bars.ensure_symbol(symbol)?;
    let kind = if timeframe == Timeframe::M15 {
        JobKind::FetchIntraday
    } else {
        JobKind::FetchHistorical
    };
    let def_id = state.catalog.upsert_definition(
        symbol,
        symbol_id,
        timeframe,
        kind,
        timeframe.default_window_days(),
        priority,
        now,
    )?;

    let end = align_slice_end(now, timeframe);
    let gaps = state
        .coverage
        .gaps(symbol, timeframe, timeframe.default_window_days(), now)?;

    let mut inserted = 0usize;
    for gap in gaps {
        let capped = Slice {
            from: gap.from,
            to: gap.to.min(end),
        };
        if capped.to <= capped.from {
            continue;
        }
        let slices = split_gap_into_slices(capped, timeframe);
        inserted += state
            .queue
            .enqueue_slices(def_id, symbol, timeframe, kind, &slices, triggered_by, now)
            .await?;
    }
    Ok(inserted)
}

/// Split a gap into fetch slices. Intraday timeframes slice per UTC day;
/// d1/w1 fetch the whole window in one slice. Bounds snap to the day grid
/// (except the final cap) so hashes stay stable across ticks.
pub fn split_gap_into_slices(gap: Slice, timeframe: Timeframe) -> Vec<Slice> {
    let day = Duration::days(1);
    let floor_day = |ts: DateTime<Utc>| align_slice_end(ts, Timeframe::D1);

    match timeframe {
        Timeframe::M15 | Timeframe::H1 | Timeframe::H4 => {
            let mut slices = Vec::new();
            let mut cursor = floor_day(gap.from);
            while cursor < gap.to {
                let slice_to = (cursor + day).min(gap.to);
                if slice_to > cursor {
                    slices.push(Slice {
                        from: cursor,
                        to: slice_to,
                    });
                }
                cursor += day;
            }
            slices
        }
        Timeframe::D1 | Timeframe::W1 => vec![Slice {
            from: floor_day(gap.from),
            to: gap.to,
        }],
    }
}
