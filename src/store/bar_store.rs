//! Layered OHLC bar store.
//!
//! Writes are partitioned by provider: market providers may only write
//! historical or intraday rows, tradier only today's intraday rows, and the
//! forecast writer only future rows with both confidence bands. Validation
//! is per-row and fail-closed; one bad row never aborts its siblings.
//!
//! Reads classify layers by the bar timestamp in America/New_York. The
//! stored `is_intraday` flag is a snapshot taken at write time and goes
//! stale as days roll over, so no read path consults it.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

use crate::clock::{bucket_start, market_day_et, utc_date};
use crate::models::{Bar, DataStatus, ProviderId, Timeframe};
use crate::store::db::Db;

/// Why a row was refused at the write boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarValidationError {
    #[error("{0} bars cannot be forecasts")]
    ForecastFromMarketProvider(&'static str),
    #[error("{0} bar dated today or later must be flagged intraday")]
    HistoricalNotBeforeToday(&'static str),
    #[error("tradier bars must be intraday")]
    TradierNotIntraday,
    #[error("tradier bars cannot be forecasts")]
    TradierForecast,
    #[error("tradier bar is not on today's market day")]
    TradierNotToday,
    #[error("ml_forecast bars must be flagged is_forecast")]
    ForecastFlagMissing,
    #[error("ml_forecast bars cannot be intraday")]
    ForecastIntraday,
    #[error("ml_forecast bar must be dated strictly in the future")]
    ForecastNotFuture,
    #[error("ml_forecast bar is missing confidence bands")]
    ForecastMissingBands,
}

/// Per-batch outcome: how many rows were applied and which were refused.
#[derive(Debug, Default)]
pub struct UpsertReport {
    pub written: usize,
    pub rejected: Vec<(usize, BarValidationError)>,
}

/// The three disjoint read layers.
#[derive(Debug, Default)]
pub struct Layers {
    pub historical: Vec<Bar>,
    pub intraday: Vec<Bar>,
    pub forecast: Vec<Bar>,
}

/// Chart read result: non-forecast bars ascending, forecasts appended.
#[derive(Debug, Default)]
pub struct ChartBars {
    pub bars: Vec<Bar>,
    pub forecast_bars: Vec<Bar>,
}

#[derive(Clone)]
pub struct BarStore {
    db: Db,
}

impl BarStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Validate a row against the write-partition invariants.
    pub fn validate(bar: &Bar, now: DateTime<Utc>) -> std::result::Result<(), BarValidationError> {
        match bar.provider {
            ProviderId::Alpaca | ProviderId::Polygon | ProviderId::Yfinance => {
                let name = bar.provider.as_str();
                if bar.is_forecast {
                    return Err(BarValidationError::ForecastFromMarketProvider(name));
                }
                if !bar.is_intraday && utc_date(bar.ts) >= utc_date(now) {
                    return Err(BarValidationError::HistoricalNotBeforeToday(name));
                }
            }
            ProviderId::Tradier => {
                if bar.is_forecast {
                    return Err(BarValidationError::TradierForecast);
                }
                if !bar.is_intraday {
                    return Err(BarValidationError::TradierNotIntraday);
                }
                if market_day_et(bar.ts) != market_day_et(now) {
                    return Err(BarValidationError::TradierNotToday);
                }
            }
            ProviderId::MlForecast => {
                if !bar.is_forecast {
                    return Err(BarValidationError::ForecastFlagMissing);
                }
                if bar.is_intraday {
                    return Err(BarValidationError::ForecastIntraday);
                }
                if utc_date(bar.ts) <= utc_date(now) {
                    return Err(BarValidationError::ForecastNotFuture);
                }
                if bar.upper_band.is_none() || bar.lower_band.is_none() {
                    return Err(BarValidationError::ForecastMissingBands);
                }
            }
        }
        Ok(())
    }

    /// Upsert a batch of bars. Rows are deduplicated by the bar identity key
    /// (last occurrence wins), validated per-row, and applied in one
    /// transaction. Idempotent: re-applying the same batch is a no-op apart
    /// from `updated_at`.
    pub fn upsert_bars(&self, bars: &[Bar], now: DateTime<Utc>) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        if bars.is_empty() {
            return Ok(report);
        }

        // Validate first, then collapse duplicates within the batch.
        let mut keyed: Vec<Bar> = Vec::with_capacity(bars.len());
        let mut seen: HashMap<(String, Timeframe, i64, ProviderId, bool), usize> = HashMap::new();
        for (i, bar) in bars.iter().enumerate() {
            if let Err(e) = Self::validate(bar, now) {
                report.rejected.push((i, e));
                continue;
            }
            let key = (
                bar.symbol.clone(),
                bar.timeframe,
                bar.ts.timestamp(),
                bar.provider,
                bar.is_forecast,
            );
            match seen.get(&key) {
                Some(&pos) => keyed[pos] = bar.clone(),
                None => {
                    seen.insert(key, keyed.len());
                    keyed.push(bar.clone());
                }
            }
        }

        if keyed.is_empty() {
            return Ok(report);
        }

        let conn = self.db.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<usize> {
            let mut written = 0usize;
            let mut symbol_ids: HashMap<String, i64> = HashMap::new();
            for bar in &keyed {
                let symbol_id = match symbol_ids.get(&bar.symbol) {
                    Some(&id) => id,
                    None => {
                        let id = ensure_symbol(&conn, &bar.symbol)?;
                        symbol_ids.insert(bar.symbol.clone(), id);
                        id
                    }
                };

                let mut stmt = conn.prepare_cached(
                    "INSERT INTO bars
                        (symbol_id, timeframe, ts, open, high, low, close, volume,
                         provider, is_intraday, is_forecast, data_status,
                         confidence_score, upper_band, lower_band,
                         fetched_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?17)
                     ON CONFLICT(symbol_id, timeframe, ts, provider, is_forecast) DO UPDATE SET
                        open = excluded.open,
                        high = excluded.high,
                        low = excluded.low,
                        close = excluded.close,
                        volume = excluded.volume,
                        is_intraday = excluded.is_intraday,
                        data_status = excluded.data_status,
                        confidence_score = excluded.confidence_score,
                        upper_band = excluded.upper_band,
                        lower_band = excluded.lower_band,
                        fetched_at = excluded.fetched_at,
                        updated_at = excluded.updated_at",
                )?;
                stmt.execute(params![
                    symbol_id,
                    bar.timeframe.as_str(),
                    bar.ts.timestamp(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume as i64,
                    bar.provider.as_str(),
                    bar.is_intraday as i64,
                    bar.is_forecast as i64,
                    bar.data_status.as_str(),
                    bar.confidence_score,
                    bar.upper_band,
                    bar.lower_band,
                    bar.fetched_at.timestamp(),
                    now.timestamp(),
                ])?;
                written += 1;
            }
            Ok(written)
        })();

        match result {
            Ok(written) => {
                conn.execute("COMMIT", [])?;
                report.written = written;
                if !report.rejected.is_empty() {
                    debug!(
                        written = report.written,
                        rejected = report.rejected.len(),
                        "bar upsert finished with per-row rejections"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e).context("bar upsert transaction failed")
            }
        }
    }

    /// Read the last `max_bars` non-forecast bars ascending, optionally
    /// followed by up to 20 forecast bars. For h1/h4, buckets the native
    /// timeframe does not cover are aggregated from m15.
    pub fn read_chart(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        max_bars: usize,
        include_forecast: bool,
        now: DateTime<Utc>,
    ) -> Result<ChartBars> {
        let conn = self.db.lock();
        let Some(symbol_id) = symbol_id(&conn, symbol)? else {
            return Ok(ChartBars::default());
        };

        // Calendar lookback padded for weekends and holidays.
        let sessions = (max_bars as f64 / timeframe.bars_per_day()).ceil();
        let lookback_days = (sessions * 1.6).ceil() as i64 + 5;
        let from = now - Duration::days(lookback_days);

        let native = select_bars(
            &conn,
            symbol_id,
            symbol,
            timeframe,
            false,
            from.timestamp(),
            now.timestamp(),
        )?;
        let mut merged = dedup_by_provider_priority(native, now);

        if matches!(timeframe, Timeframe::H1 | Timeframe::H4) {
            let m15 = select_bars(
                &conn,
                symbol_id,
                symbol,
                Timeframe::M15,
                false,
                from.timestamp(),
                now.timestamp(),
            )?;
            for agg in aggregate_m15(&m15, timeframe, now) {
                // Native rows win over aggregation for the same bucket.
                merged.entry(agg.ts.timestamp()).or_insert(agg);
            }
        }

        let mut bars: Vec<Bar> = merged.into_values().collect();
        if bars.len() > max_bars {
            bars.drain(..bars.len() - max_bars);
        }

        let mut forecast_bars = Vec::new();
        if include_forecast {
            let after = bars.last().map(|b| b.ts).unwrap_or(now).timestamp();
            forecast_bars = select_forecast_bars(&conn, symbol_id, symbol, timeframe, after, 20)?;
        }

        Ok(ChartBars {
            bars,
            forecast_bars,
        })
    }

    /// Split the stored bars in `[start, end]` into the three disjoint
    /// layers, classifying by the timestamp's market day in New York.
    pub fn read_layers(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Layers> {
        let conn = self.db.lock();
        let Some(symbol_id) = symbol_id(&conn, symbol)? else {
            return Ok(Layers::default());
        };

        let mut stmt = conn.prepare_cached(
            "SELECT ts, open, high, low, close, volume, provider, is_intraday, is_forecast,
                    data_status, confidence_score, upper_band, lower_band, fetched_at
             FROM bars
             WHERE symbol_id = ?1 AND timeframe = ?2 AND ts >= ?3 AND ts <= ?4
             ORDER BY ts ASC",
        )?;
        let rows: Vec<Bar> = stmt
            .query_map(
                params![
                    symbol_id,
                    timeframe.as_str(),
                    start.timestamp(),
                    end.timestamp()
                ],
                |row| row_to_bar(row, symbol, timeframe),
            )?
            .collect::<rusqlite::Result<_>>()?;

        let today_et = market_day_et(now);
        let mut layers = Layers::default();
        for bar in rows {
            let day = market_day_et(bar.ts);
            if bar.is_forecast {
                if day > today_et {
                    layers.forecast.push(bar);
                }
            } else if day == today_et {
                layers.intraday.push(bar);
            } else if day < today_et {
                layers.historical.push(bar);
            }
            // Non-forecast rows dated in the future are unreachable through
            // the validated write paths and are simply not surfaced.
        }
        Ok(layers)
    }

    /// Newest non-forecast bar timestamp, if any.
    pub fn newest_ts(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db.lock();
        let Some(symbol_id) = symbol_id(&conn, symbol)? else {
            return Ok(None);
        };
        let ts: Option<i64> = conn
            .query_row(
                "SELECT MAX(ts) FROM bars
                 WHERE symbol_id = ?1 AND timeframe = ?2 AND is_forecast = 0",
                params![symbol_id, timeframe.as_str()],
                |row| row.get(0),
            )
            .context("newest_ts query failed")?;
        Ok(ts.and_then(|t| DateTime::from_timestamp(t, 0)))
    }

    /// Oldest non-forecast bar timestamp, if any.
    pub fn oldest_ts(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<DateTime<Utc>>> {
        let conn = self.db.lock();
        let Some(symbol_id) = symbol_id(&conn, symbol)? else {
            return Ok(None);
        };
        let ts: Option<i64> = conn
            .query_row(
                "SELECT MIN(ts) FROM bars
                 WHERE symbol_id = ?1 AND timeframe = ?2 AND is_forecast = 0",
                params![symbol_id, timeframe.as_str()],
                |row| row.get(0),
            )
            .context("oldest_ts query failed")?;
        Ok(ts.and_then(|t| DateTime::from_timestamp(t, 0)))
    }

    /// Register a ticker (idempotent) and return its id.
    pub fn ensure_symbol(&self, ticker: &str) -> Result<i64> {
        let conn = self.db.lock();
        ensure_symbol(&conn, ticker)
    }
}

fn ensure_symbol(conn: &Connection, ticker: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO symbols (ticker) VALUES (?1) ON CONFLICT(ticker) DO NOTHING",
        params![ticker],
    )?;
    let id: i64 = conn
        .query_row(
            "SELECT id FROM symbols WHERE ticker = ?1",
            params![ticker],
            |row| row.get(0),
        )
        .with_context(|| format!("symbol row missing after upsert: {}", ticker))?;
    Ok(id)
}

fn symbol_id(conn: &Connection, ticker: &str) -> Result<Option<i64>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM symbols WHERE ticker = ?1 LIMIT 1")?;
    let mut rows = stmt.query([ticker])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
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

fn row_to_bar(row: &rusqlite::Row, symbol: &str, timeframe: Timeframe) -> rusqlite::Result<Bar> {
    let ts: i64 = row.get(0)?;
    let provider_str: String = row.get(6)?;
    let status_str: String = row.get(9)?;
    let volume: i64 = row.get(5)?;
    let fetched_at: i64 = row.get(13)?;

    let provider = ProviderId::parse_str(&provider_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown provider {}", provider_str).into(),
        )
    })?;
    let data_status = DataStatus::parse_str(&status_str).unwrap_or(DataStatus::Live);

    Ok(Bar {
        symbol: symbol.to_string(),
        timeframe,
        ts: dt_col(ts, 0)?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        volume: volume.max(0) as u64,
        provider,
        is_intraday: row.get::<_, i64>(7)? != 0,
        is_forecast: row.get::<_, i64>(8)? != 0,
        data_status,
        confidence_score: row.get(10)?,
        upper_band: row.get(11)?,
        lower_band: row.get(12)?,
        fetched_at: dt_col(fetched_at, 13)?,
    })
}

fn select_bars(
    conn: &Connection,
    symbol_id: i64,
    symbol: &str,
    timeframe: Timeframe,
    forecast: bool,
    from_ts: i64,
    to_ts: i64,
) -> Result<Vec<Bar>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, open, high, low, close, volume, provider, is_intraday, is_forecast,
                data_status, confidence_score, upper_band, lower_band, fetched_at
         FROM bars
         WHERE symbol_id = ?1 AND timeframe = ?2 AND is_forecast = ?3
           AND ts >= ?4 AND ts <= ?5
         ORDER BY ts ASC",
    )?;
    let bars = stmt
        .query_map(
            params![
                symbol_id,
                timeframe.as_str(),
                forecast as i64,
                from_ts,
                to_ts
            ],
            |row| row_to_bar(row, symbol, timeframe),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bars)
}

fn select_forecast_bars(
    conn: &Connection,
    symbol_id: i64,
    symbol: &str,
    timeframe: Timeframe,
    after_ts: i64,
    limit: usize,
) -> Result<Vec<Bar>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, open, high, low, close, volume, provider, is_intraday, is_forecast,
                data_status, confidence_score, upper_band, lower_band, fetched_at
         FROM bars
         WHERE symbol_id = ?1 AND timeframe = ?2 AND is_forecast = 1 AND ts > ?3
         ORDER BY ts ASC
         LIMIT ?4",
    )?;
    let bars = stmt
        .query_map(
            params![symbol_id, timeframe.as_str(), after_ts, limit as i64],
            |row| row_to_bar(row, symbol, timeframe),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(bars)
}

/// Collapse same-timestamp rows from several providers down to one bar per
/// timestamp using the dedup priority (today's bars rank with the intraday
/// table, older ones with the historical table).
fn dedup_by_provider_priority(bars: Vec<Bar>, now: DateTime<Utc>) -> BTreeMap<i64, Bar> {
    let today_et = market_day_et(now);
    let mut best: BTreeMap<i64, Bar> = BTreeMap::new();
    for bar in bars {
        let intraday = market_day_et(bar.ts) == today_et;
        let rank = bar.provider.priority_rank(intraday);
        match best.get(&bar.ts.timestamp()) {
            Some(existing) => {
                let existing_intraday = market_day_et(existing.ts) == today_et;
                if rank < existing.provider.priority_rank(existing_intraday) {
                    best.insert(bar.ts.timestamp(), bar);
                }
            }
            None => {
                best.insert(bar.ts.timestamp(), bar);
            }
        }
    }
    best
}

/// Roll m15 bars up into h1/h4 buckets: open of the first member, max high,
/// min low, close of the last member, summed volume. One provider is chosen
/// per bucket before composing so mixed-provider buckets stay coherent.
fn aggregate_m15(m15: &[Bar], target: Timeframe, now: DateTime<Utc>) -> Vec<Bar> {
    let today_et = market_day_et(now);
    let mut buckets: BTreeMap<i64, Vec<&Bar>> = BTreeMap::new();
    for bar in m15 {
        let start = bucket_start(bar.ts, target);
        buckets.entry(start.timestamp()).or_default().push(bar);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (bucket_ts, mut members) in buckets {
        members.sort_by_key(|b| b.ts);
        let bucket_is_today = members
            .first()
            .map(|b| market_day_et(b.ts) == today_et)
            .unwrap_or(false);

        let Some(chosen) = members
            .iter()
            .map(|b| b.provider)
            .min_by_key(|p| p.priority_rank(bucket_is_today))
        else {
            continue;
        };
        let members: Vec<&&Bar> = members.iter().filter(|b| b.provider == chosen).collect();
        let (Some(first), Some(last)) = (members.first(), members.last()) else {
            continue;
        };

        let Some(ts) = DateTime::from_timestamp(bucket_ts, 0) else {
            continue;
        };
        out.push(Bar {
            symbol: first.symbol.clone(),
            timeframe: target,
            ts,
            open: first.open,
            high: members.iter().map(|b| b.high).max().unwrap_or(first.high),
            low: members.iter().map(|b| b.low).min().unwrap_or(first.low),
            close: last.close,
            volume: members.iter().map(|b| b.volume).sum(),
            provider: chosen,
            is_intraday: bucket_is_today,
            is_forecast: false,
            data_status: last.data_status,
            confidence_score: None,
            upper_band: None,
            lower_band: None,
            fetched_at: members
                .iter()
                .map(|b| b.fetched_at)
                .max()
                .unwrap_or(first.fetched_at),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store() -> BarStore {
        BarStore::new(Db::open_memory().expect("open db"))
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn bar(
        symbol: &str,
        tf: Timeframe,
        ts: DateTime<Utc>,
        provider: ProviderId,
        close: i64,
    ) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            timeframe: tf,
            ts,
            open: close - 100,
            high: close + 200,
            low: close - 300,
            close,
            volume: 1_000,
            provider,
            is_intraday: false,
            is_forecast: false,
            data_status: DataStatus::Verified,
            confidence_score: None,
            upper_band: None,
            lower_band: None,
            fetched_at: ts,
        }
    }

    // A "now" well inside a weekday session: 2024-03-06 15:00 UTC (Wed).
    fn now() -> DateTime<Utc> {
        at(2024, 3, 6, 15, 0)
    }

    #[test]
    fn upsert_is_idempotent() {
        let s = store();
        let b = bar("AAPL", Timeframe::D1, at(2024, 3, 1, 0, 0), ProviderId::Alpaca, 1_700_000);
        let r1 = s.upsert_bars(&[b.clone()], now()).unwrap();
        assert_eq!(r1.written, 1);
        let r2 = s.upsert_bars(&[b], now()).unwrap();
        assert_eq!(r2.written, 1);

        let chart = s.read_chart("AAPL", Timeframe::D1, 10, false, now()).unwrap();
        assert_eq!(chart.bars.len(), 1);
        assert_eq!(chart.bars[0].close, 1_700_000);
    }

    #[test]
    fn invalid_rows_do_not_abort_siblings() {
        let s = store();
        let good = bar("AAPL", Timeframe::D1, at(2024, 3, 1, 0, 0), ProviderId::Alpaca, 1_700_000);
        // Alpaca bar dated today without the intraday flag violates the
        // historical partition.
        let bad = bar("AAPL", Timeframe::D1, at(2024, 3, 6, 0, 0), ProviderId::Alpaca, 1_710_000);
        let report = s.upsert_bars(&[bad, good], now()).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, 0);
        assert_eq!(
            report.rejected[0].1,
            BarValidationError::HistoricalNotBeforeToday("alpaca")
        );
    }

    #[test]
    fn tradier_must_be_today_intraday() {
        let s = store();
        let mut b = bar("AAPL", Timeframe::M15, at(2024, 3, 5, 15, 0), ProviderId::Tradier, 10_000);
        b.is_intraday = true;
        let report = s.upsert_bars(&[b], now()).unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.rejected[0].1, BarValidationError::TradierNotToday);
    }

    #[test]
    fn forecast_rows_need_future_date_and_bands() {
        let s = store();
        let mut f = bar("AAPL", Timeframe::D1, at(2024, 3, 8, 0, 0), ProviderId::MlForecast, 10_000);
        f.is_forecast = true;
        assert_eq!(
            s.upsert_bars(&[f.clone()], now()).unwrap().rejected[0].1,
            BarValidationError::ForecastMissingBands
        );

        f.upper_band = Some(10_500);
        f.lower_band = Some(9_500);
        assert_eq!(s.upsert_bars(&[f.clone()], now()).unwrap().written, 1);

        f.ts = at(2024, 3, 6, 0, 0);
        assert_eq!(
            s.upsert_bars(&[f], now()).unwrap().rejected[0].1,
            BarValidationError::ForecastNotFuture
        );
    }

    #[test]
    fn provider_priority_wins_on_shared_timestamp() {
        let s = store();
        let ts = at(2024, 3, 1, 0, 0);
        let alpaca = bar("AAPL", Timeframe::D1, ts, ProviderId::Alpaca, 1_000_000);
        let polygon = bar("AAPL", Timeframe::D1, ts, ProviderId::Polygon, 2_000_000);
        let yf = bar("AAPL", Timeframe::D1, ts, ProviderId::Yfinance, 3_000_000);
        s.upsert_bars(&[alpaca, polygon, yf], now()).unwrap();

        let chart = s.read_chart("AAPL", Timeframe::D1, 10, false, now()).unwrap();
        assert_eq!(chart.bars.len(), 1);
        assert_eq!(chart.bars[0].provider, ProviderId::Polygon);
        assert_eq!(chart.bars[0].close, 2_000_000);
    }

    #[test]
    fn h1_aggregates_from_m15_when_native_absent() {
        let s = store();
        // Four m15 bars for the 10:00 UTC hour on a past day.
        let mut rows = Vec::new();
        let closes = [10_000i64, 10_100, 9_900, 10_050];
        for (i, close) in closes.iter().enumerate() {
            let mut b = bar(
                "AAPL",
                Timeframe::M15,
                at(2024, 3, 1, 10, 15 * i as u32),
                ProviderId::Alpaca,
                *close,
            );
            b.open = 9_000 + i as i64;
            b.high = close + 10;
            b.low = close - 10;
            b.volume = 100 + i as u64;
            rows.push(b);
        }
        s.upsert_bars(&rows, now()).unwrap();

        let chart = s.read_chart("AAPL", Timeframe::H1, 10, false, now()).unwrap();
        assert_eq!(chart.bars.len(), 1);
        let h1 = &chart.bars[0];
        assert_eq!(h1.ts, at(2024, 3, 1, 10, 0));
        assert_eq!(h1.open, 9_000);
        assert_eq!(h1.high, 10_110);
        assert_eq!(h1.low, 9_890);
        assert_eq!(h1.close, 10_050);
        assert_eq!(h1.volume, 406);
    }

    #[test]
    fn native_h1_wins_over_aggregation() {
        let s = store();
        let m15 = bar("AAPL", Timeframe::M15, at(2024, 3, 1, 10, 0), ProviderId::Alpaca, 10_000);
        let native = bar("AAPL", Timeframe::H1, at(2024, 3, 1, 10, 0), ProviderId::Alpaca, 42_000);
        s.upsert_bars(&[m15, native], now()).unwrap();

        let chart = s.read_chart("AAPL", Timeframe::H1, 10, false, now()).unwrap();
        assert_eq!(chart.bars.len(), 1);
        assert_eq!(chart.bars[0].close, 42_000);
    }

    #[test]
    fn layers_classify_by_eastern_day() {
        let s = store();
        // 09:45 ET on 2024-03-06 = 14:45 UTC; written through the intraday path.
        let mut today_bar = bar(
            "AAPL",
            Timeframe::M15,
            at(2024, 3, 6, 14, 45),
            ProviderId::Alpaca,
            10_000,
        );
        today_bar.is_intraday = true;
        let yesterday = bar(
            "AAPL",
            Timeframe::M15,
            at(2024, 3, 5, 14, 45),
            ProviderId::Alpaca,
            9_000,
        );
        s.upsert_bars(&[today_bar, yesterday], now()).unwrap();

        let layers = s
            .read_layers(
                "AAPL",
                Timeframe::M15,
                at(2024, 3, 4, 0, 0),
                at(2024, 3, 8, 0, 0),
                now(),
            )
            .unwrap();
        assert_eq!(layers.historical.len(), 1);
        assert_eq!(layers.intraday.len(), 1);
        assert_eq!(layers.intraday[0].close, 10_000);
        assert!(layers.forecast.is_empty());
    }

    #[test]
    fn midnight_utc_bar_moves_layers_after_et_rollover() {
        let s = store();
        // 2024-03-06 00:00 UTC is 19:00 ET on 2024-03-05.
        let ts = at(2024, 3, 6, 0, 0);
        let mut b = bar("AAPL", Timeframe::M15, ts, ProviderId::Tradier, 10_000);
        b.is_intraday = true;

        // While it is still 2024-03-05 in New York, the row is intraday.
        let evening = at(2024, 3, 6, 1, 0);
        s.upsert_bars(&[b], evening).unwrap();
        let layers = s
            .read_layers("AAPL", Timeframe::M15, at(2024, 3, 5, 0, 0), at(2024, 3, 7, 0, 0), evening)
            .unwrap();
        assert_eq!(layers.intraday.len(), 1);

        // After the Eastern day rolls over it reads as historical.
        let next_day = at(2024, 3, 6, 15, 0);
        let layers = s
            .read_layers("AAPL", Timeframe::M15, at(2024, 3, 5, 0, 0), at(2024, 3, 7, 0, 0), next_day)
            .unwrap();
        assert_eq!(layers.intraday.len(), 0);
        assert_eq!(layers.historical.len(), 1);
    }

    #[test]
    fn forecast_bars_stay_out_of_market_layers() {
        let s = store();
        let hist = bar("AAPL", Timeframe::D1, at(2024, 3, 1, 0, 0), ProviderId::Alpaca, 9_000);
        let mut fc = bar("AAPL", Timeframe::D1, at(2024, 3, 8, 0, 0), ProviderId::MlForecast, 11_000);
        fc.is_forecast = true;
        fc.upper_band = Some(11_500);
        fc.lower_band = Some(10_500);
        fc.confidence_score = Some(0.8);
        s.upsert_bars(&[hist, fc], now()).unwrap();

        let layers = s
            .read_layers("AAPL", Timeframe::D1, at(2024, 2, 1, 0, 0), at(2024, 4, 1, 0, 0), now())
            .unwrap();
        assert_eq!(layers.historical.len(), 1);
        assert_eq!(layers.forecast.len(), 1);
        assert!(layers.forecast[0].is_forecast);
    }

    #[test]
    fn chart_appends_forecast_bars() {
        let s = store();
        let hist = bar("AAPL", Timeframe::D1, at(2024, 3, 1, 0, 0), ProviderId::Alpaca, 9_000);
        let mut rows = vec![hist];
        for d in [8, 9, 10] {
            let mut fc = bar("AAPL", Timeframe::D1, at(2024, 3, d, 0, 0), ProviderId::MlForecast, 11_000);
            fc.is_forecast = true;
            fc.upper_band = Some(11_500);
            fc.lower_band = Some(10_500);
            fc.confidence_score = Some(0.7);
            rows.push(fc);
        }
        s.upsert_bars(&rows, now()).unwrap();

        let chart = s.read_chart("AAPL", Timeframe::D1, 30, true, now()).unwrap();
        assert_eq!(chart.bars.len(), 1);
        assert_eq!(chart.forecast_bars.len(), 3);
        assert!(chart.bars.last().unwrap().ts < chart.forecast_bars[0].ts);
    }

    #[test]
    fn unknown_symbol_reads_empty() {
        let s = store();
        let chart = s.read_chart("ZZZZ", Timeframe::D1, 10, true, now()).unwrap();
        assert!(chart.bars.is_empty());
        assert!(chart.forecast_bars.is_empty());
        assert!(s.newest_ts("ZZZZ", Timeframe::D1).unwrap().is_none());
    }
}
