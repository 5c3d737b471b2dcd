//! End-to-end ingestion flow, in-process with mock providers.
//!
//! Drives the same path production takes: symbol sync creates definitions,
//! the orchestrator tick derives gaps and enqueues deduplicated slices,
//! workers claim and execute them against the (mock) provider, coverage
//! advances, and the chart read serves the stored bars.

use async_trait::async_trait;
use axum::extract::{Json as AxumJson, State as AxumState};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use barfeed_backend::clock::align_slice_end;
use barfeed_backend::models::{Config, ProviderId, RunStatus, Timeframe};
use barfeed_backend::orchestrator::{execute_run, run_tick};
use barfeed_backend::providers::{
    BarBatch, MarketDataProvider, ProviderBar, ProviderError, ProviderSet,
};
use barfeed_backend::api::handlers::{
    post_chart_read, post_sync_user_symbols, SyncSymbolsRequest,
};
use barfeed_backend::state::AppState;
use barfeed_backend::store::Db;

/// Adapter that always returns the same recent historical batch.
struct FixedProvider {
    id: ProviderId,
    bars: Vec<ProviderBar>,
}

#[async_trait]
impl MarketDataProvider for FixedProvider {
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
        Ok(BarBatch {
            provider: self.id,
            bars: self.bars.clone(),
        })
    }
}

fn recent_historical_bars() -> Vec<ProviderBar> {
    // Four m15-grid bars three days back, safely before today in UTC.
    let start = align_slice_end(Utc::now() - Duration::days(3), Timeframe::M15);
    (0..4)
        .map(|i| ProviderBar {
            ts: start + Duration::minutes(15 * i),
            open: 170.0 + i as f64,
            high: 171.0 + i as f64,
            low: 169.0 + i as f64,
            close: 170.5 + i as f64,
            volume: 1_000 + i as u64,
        })
        .collect()
}

fn test_state(dir: &tempfile::TempDir) -> AppState {
    let db_path = dir.path().join("ingest_flow.db");
    let db = Db::open(db_path.to_str().expect("utf8 path")).expect("open db");
    let providers = ProviderSet::with_adapters(vec![Arc::new(FixedProvider {
        id: ProviderId::Alpaca,
        bars: recent_historical_bars(),
    })]);
    let state = AppState::new(Config::from_env(), db, providers);
    state
        .rate
        .seed_defaults(&state.config, Utc::now())
        .expect("seed buckets");
    state
}

#[tokio::test]
async fn subscribe_tick_ingest_and_read() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = test_state(&dir);

    // First subscribe: three timeframes, watchlist priority.
    let sync = post_sync_user_symbols(
        AxumState(state.clone()),
        AxumJson(SyncSymbolsRequest {
            symbols: vec!["aapl".to_string()],
            source: "watchlist".to_string(),
            timeframes: Some(vec![Timeframe::M15, Timeframe::H1, Timeframe::H4]),
        }),
    )
    .await
    .expect("sync ok")
    .0;
    assert!(sync.success);
    assert_eq!(sync.jobs_updated, 3);
    assert_eq!(sync.priority, 300);
    assert_eq!(sync.symbols_tracked, 1);

    // One tick enqueues runs for every gap.
    let now = Utc::now();
    let summary = run_tick(&state, now).await.expect("tick ok");
    assert_eq!(summary.defs_scanned, 3);
    assert!(summary.slices_enqueued >= 3, "expected slices for all gaps");

    // A second tick at the same instant dedups everything it just enqueued.
    let again = run_tick(&state, now).await.expect("tick ok");
    assert_eq!(again.slices_enqueued, 0, "slice hashes must dedup");

    // Drain the queue: each tick dispatches a bounded worker batch.
    for _ in 0..80 {
        if state.queue.queued_count().expect("count") == 0 {
            break;
        }
        run_tick(&state, Utc::now()).await.expect("tick ok");
    }
    assert_eq!(state.queue.queued_count().expect("count"), 0);

    // Every timeframe saw at least one successful slice with rows.
    for timeframe in [Timeframe::M15, Timeframe::H1, Timeframe::H4] {
        let cov = state
            .coverage
            .get("AAPL", timeframe)
            .expect("coverage query")
            .unwrap_or_else(|| panic!("coverage missing for {}", timeframe.as_str()));
        assert!(cov.last_rows_written > 0);
        assert_eq!(cov.last_provider, "alpaca");
    }

    // The chart read serves the ingested bars.
    let chart = post_chart_read(
        AxumState(state.clone()),
        AxumJson(
            serde_json::from_value(serde_json::json!({
                "symbol": "AAPL",
                "timeframe": "m15",
                "days": 7,
                "includeMLData": false
            }))
            .expect("request parse"),
        ),
    )
    .await
    .expect("chart ok")
    .0;
    let bars = chart["bars"].as_array().expect("bars array");
    assert!(!bars.is_empty());
    assert_eq!(chart["symbol"], "AAPL");
    assert!(chart["dataQuality"]["barCount"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn failed_runs_requeue_and_attempts_advance() {
    struct FlakyProvider;

    #[async_trait]
    impl MarketDataProvider for FlakyProvider {
        fn id(&self) -> ProviderId {
            ProviderId::Alpaca
        }

        async fn fetch_bars(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<BarBatch, ProviderError> {
            Err(ProviderError::Transient("upstream 503".to_string()))
        }
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("flaky.db");
    let db = Db::open(db_path.to_str().expect("utf8 path")).expect("open db");
    let providers = ProviderSet::with_adapters(vec![Arc::new(FlakyProvider)]);
    // No tick-dispatched workers: this test drives the claim itself.
    let mut config = Config::from_env();
    config.max_concurrent_workers = 0;
    let state = AppState::new(config, db, providers);

    post_sync_user_symbols(
        AxumState(state.clone()),
        AxumJson(SyncSymbolsRequest {
            symbols: vec!["MSFT".to_string()],
            source: "recent_search".to_string(),
            timeframes: Some(vec![Timeframe::D1]),
        }),
    )
    .await
    .expect("sync ok");

    let now = Utc::now();
    let summary = run_tick(&state, now).await.expect("tick ok");
    assert_eq!(summary.slices_enqueued, 1);
    assert_eq!(summary.workers_dispatched, 0);

    // The transient failure sends the run back to queued with attempt 2.
    let run = state.queue.claim_next(None, now).expect("claim").expect("run present");
    assert_eq!(run.symbol, "MSFT");
    execute_run(&state, run.clone(), now).await.expect("execute");
    let record = state.queue.get_run(&run.id).expect("get").expect("record");
    assert_eq!(record.status, RunStatus::Queued);
    assert_eq!(record.attempt, 2);

    // The retry is claimable again, exactly once.
    let retry = state.queue.claim_next(None, now).expect("claim").expect("retry present");
    assert_eq!(retry.id, run.id);
    assert!(state.queue.claim_next(None, now).expect("claim").is_none());
}
