//! HTTP handlers for the external surface: health, orchestrator trigger,
//! symbol sync, chart read and diagnostics.

use axum::{
    extract::{Json as AxumJson, Query, State as AxumState},
    http::StatusCode,
    response::Json,
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::clock::{is_market_hours, now_utc};
use crate::models::{fixed4_to_f64, Bar, JobKind, Timeframe};
use crate::orchestrator::tick::{enqueue_symbol_refresh, run_tick};
use crate::state::AppState;

/// Priority assigned per subscription source.
fn source_priority(source: &str) -> i64 {
    match source {
        "watchlist" => 300,
        "chart_view" => 200,
        _ => 100,
    }
}

/// Maximum acceptable age of the newest bar before a chart counts as stale.
fn max_age_secs(timeframe: Timeframe) -> i64 {
    match timeframe {
        Timeframe::M15 => 30 * 60,
        Timeframe::H1 => 2 * 3_600,
        Timeframe::H4 => 6 * 3_600,
        Timeframe::D1 => 36 * 3_600,
        Timeframe::W1 => 8 * 86_400,
    }
}

/// Outside regular hours the newest bar is naturally older; allow a full
/// overnight session on top of the base ceiling.
const OVERNIGHT_ALLOWANCE_SECS: i64 = 16 * 3_600;

fn err_json(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "success": false, "error": message })))
}

pub async fn health_check() -> &'static str {
    "📈 Barfeed operational - ingestion orchestrator active"
}

// ---------------------------------------------------------------------------
// POST /orchestrator/tick
// ---------------------------------------------------------------------------

pub async fn post_orchestrator_tick(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    // Same exclusion as the scheduler driver: ticks never overlap.
    let _guard = state.tick_lock.lock().await;
    match run_tick(&state, now_utc()).await {
        Ok(summary) => Ok(Json(json!({
            "defs_scanned": summary.defs_scanned,
            "slices_enqueued": summary.slices_enqueued,
            "workers_dispatched": summary.workers_dispatched,
        }))),
        Err(e) => {
            warn!(error = %e, "manual tick failed");
            Err(err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// POST /sync-user-symbols
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SyncSymbolsRequest {
    pub symbols: Vec<String>,
    pub source: String,
    #[serde(default)]
    pub timeframes: Option<Vec<Timeframe>>,
}

#[derive(Debug, Serialize)]
pub struct SyncSymbolsResponse {
    pub success: bool,
    pub symbols_tracked: usize,
    pub symbols_requested: usize,
    pub timeframes: usize,
    pub jobs_updated: usize,
    pub priority: i64,
    pub source: String,
}

pub async fn post_sync_user_symbols(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<SyncSymbolsRequest>,
) -> Result<Json<SyncSymbolsResponse>, (StatusCode, Json<Value>)> {
    let now = now_utc();
    let priority = source_priority(&req.source);
    let timeframes = req
        .timeframes
        .unwrap_or_else(|| vec![Timeframe::M15, Timeframe::H1, Timeframe::H4]);

    let symbols: Vec<String> = req
        .symbols
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(err_json(StatusCode::BAD_REQUEST, "no symbols provided"));
    }

    let mut jobs_updated = 0usize;
    let mut symbols_tracked = 0usize;
    for symbol in &symbols {
        let symbol_id = state
            .bars
            .ensure_symbol(symbol)
            .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
        state
            .catalog
            .track_user_symbol(symbol, &req.source, now)
            .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
        symbols_tracked += 1;

        for timeframe in &timeframes {
            let kind = if *timeframe == Timeframe::M15 {
                JobKind::FetchIntraday
            } else {
                JobKind::FetchHistorical
            };
            state
                .catalog
                .upsert_definition(
                    symbol,
                    symbol_id,
                    *timeframe,
                    kind,
                    timeframe.default_window_days(),
                    priority,
                    now,
                )
                .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
            jobs_updated += 1;
        }
    }

    Ok(Json(SyncSymbolsResponse {
        success: true,
        symbols_tracked,
        symbols_requested: req.symbols.len(),
        timeframes: timeframes.len(),
        jobs_updated,
        priority,
        source: req.source,
    }))
}

// ---------------------------------------------------------------------------
// POST /chart-read
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartReadRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    #[serde(default)]
    pub days: Option<i64>,
    #[serde(default, rename = "includeMLData")]
    pub include_ml_data: Option<bool>,
}

fn bar_to_json(bar: &Bar) -> Value {
    let mut obj = json!({
        "ts": bar.ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        "open": fixed4_to_f64(bar.open),
        "high": fixed4_to_f64(bar.high),
        "low": fixed4_to_f64(bar.low),
        "close": fixed4_to_f64(bar.close),
        "volume": bar.volume,
    });
    if let Some(map) = obj.as_object_mut() {
        if let Some(upper) = bar.upper_band {
            map.insert("upper_band".into(), json!(fixed4_to_f64(upper)));
        }
        if let Some(lower) = bar.lower_band {
            map.insert("lower_band".into(), json!(fixed4_to_f64(lower)));
        }
        if let Some(confidence) = bar.confidence_score {
            map.insert("confidence_score".into(), json!(confidence));
        }
    }
    obj
}

pub async fn post_chart_read(
    AxumState(state): AxumState<AppState>,
    AxumJson(req): AxumJson<ChartReadRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let now = now_utc();
    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(err_json(StatusCode::BAD_REQUEST, "symbol is required"));
    }
    let timeframe = req.timeframe;
    let days = req.days.unwrap_or(60).clamp(1, 3_650);
    let include_ml = req.include_ml_data.unwrap_or(false);

    let cache_key = format!("{}|{}|{}|{}", symbol, timeframe.as_str(), days, include_ml);
    if let Some(cached) = state.chart_cache.get(&cache_key) {
        return Ok(Json(cached));
    }

    let max_bars = ((days as f64 * timeframe.bars_per_day()).ceil() as usize).clamp(1, 5_000);
    let chart = state
        .bars
        .read_chart(&symbol, timeframe, max_bars, include_ml, now)
        .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;

    // Data quality relative to the newest non-forecast bar.
    let newest = chart.bars.last().map(|b| b.ts);
    let age_secs = newest.map(|ts| (now - ts).num_seconds().max(0));
    let mut stale_ceiling = max_age_secs(timeframe);
    if !is_market_hours(now) {
        stale_ceiling += OVERNIGHT_ALLOWANCE_SECS;
    }
    let is_stale = age_secs.map(|a| a > stale_ceiling).unwrap_or(true);
    let has_recent_data = age_secs.map(|a| a <= 86_400).unwrap_or(false);
    let oldest = chart.bars.first().map(|b| b.ts);
    let depth_days = oldest.map(|ts| (now - ts).num_days().max(0)).unwrap_or(0);
    let bar_count = chart.bars.len();
    let sufficient_for_ml = bar_count >= 100 && depth_days >= 30;

    // Stale or empty charts trigger a refresh enqueue; the response reports
    // the outcome but never fails because of it.
    let mut refresh = json!({
        "attempted": false,
        "enqueuedTimeframes": [],
        "insertedSlices": 0,
    });
    if is_stale {
        let mut enqueued: Vec<&str> = Vec::new();
        let mut inserted = 0usize;
        let mut refresh_error: Option<String> = None;

        // h1/h4 windows resolve from m15 for today, so refresh both.
        let mut targets = vec![timeframe];
        if matches!(timeframe, Timeframe::H1 | Timeframe::H4) {
            targets.push(Timeframe::M15);
        }
        for target in targets {
            match enqueue_symbol_refresh(&state, &symbol, target, 200, "chart_view", now).await {
                Ok(n) => {
                    inserted += n;
                    if n > 0 {
                        enqueued.push(target.as_str());
                    }
                }
                Err(e) => refresh_error = Some(e.to_string()),
            }
        }
        refresh = json!({
            "attempted": true,
            "enqueuedTimeframes": enqueued,
            "insertedSlices": inserted,
        });
        if let Some(e) = refresh_error {
            if let Some(map) = refresh.as_object_mut() {
                map.insert("error".into(), json!(e));
            }
        }
    }

    let mut bars_json: Vec<Value> = chart.bars.iter().map(bar_to_json).collect();
    bars_json.extend(chart.forecast_bars.iter().map(bar_to_json));
    let total_bars = bars_json.len();

    let response = json!({
        "symbol": symbol,
        "timeframe": timeframe.as_str(),
        "bars": bars_json,
        "metadata": {
            "total_bars": total_bars,
            "requested_days": days,
            "max_bars": max_bars,
        },
        "dataQuality": {
            "dataAgeHours": age_secs.map(|a| a as f64 / 3_600.0),
            "isStale": is_stale,
            "hasRecentData": has_recent_data,
            "historicalDepthDays": depth_days,
            "sufficientForML": sufficient_for_ml,
            "barCount": bar_count,
        },
        "refresh": refresh,
    });

    state.chart_cache.put(cache_key, response.clone());
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// GET /chart-health
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChartHealthQuery {
    pub symbol: String,
}

pub async fn get_chart_health(
    AxumState(state): AxumState<AppState>,
    Query(query): Query<ChartHealthQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let now = now_utc();
    let symbol = query.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return Err(err_json(StatusCode::BAD_REQUEST, "symbol is required"));
    }

    let mut timeframes: BTreeMap<&'static str, Value> = BTreeMap::new();
    for timeframe in Timeframe::ALL {
        let newest = state
            .bars
            .newest_ts(&symbol, timeframe)
            .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
        let entry = match newest {
            Some(ts) => json!({
                "newestTs": ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                "ageSeconds": (now - ts).num_seconds().max(0),
            }),
            None => Value::Null,
        };
        timeframes.insert(timeframe.as_str(), entry);
    }

    Ok(Json(json!({
        "symbol": symbol,
        "timeframes": timeframes,
    })))
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

pub async fn get_orchestrator_status(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let now = now_utc();
    let queue_counts = state
        .queue
        .counts_by_status()
        .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
    let enabled_defs = state
        .catalog
        .enabled_count()
        .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
    let tracked_symbols = state
        .catalog
        .tracked_symbol_count()
        .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
    let buckets = state
        .rate
        .list_status(now)
        .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;

    let queue: BTreeMap<String, i64> = queue_counts.into_iter().collect();
    Ok(Json(json!({
        "queue": queue,
        "enabledDefinitions": enabled_defs,
        "trackedSymbols": tracked_symbols,
        "rateBuckets": buckets,
        "maxConcurrentWorkers": state.config.max_concurrent_workers,
    })))
}

pub async fn get_rate_limits(
    AxumState(state): AxumState<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let buckets = state
        .rate
        .list_status(now_utc())
        .map_err(|e| err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
    Ok(Json(json!({ "buckets": buckets })))
}
