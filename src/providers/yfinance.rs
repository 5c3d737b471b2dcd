//! Yahoo Finance chart client.
//!
//! Keyless last-resort provider for historical fetches. Yahoo has no
//! 4-hour interval, so h4 requests fetch 1h bars and roll them up on the
//! UTC 4-hour grid before returning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;

use super::{
    classify_request_error, error_from_response, BarBatch, MarketDataProvider, ProviderBar,
    ProviderError, PROVIDER_TIMEOUT,
};
use crate::clock::bucket_start;
use crate::models::{ProviderId, Timeframe};

const YFINANCE_API_BASE: &str = "https://query1.finance.yahoo.com";
// Yahoo rejects requests without a browser-looking user agent.
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36";

#[derive(Clone)]
pub struct YFinanceClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    #[serde(default)]
    result: Option<Vec<ChartResult>>,
    #[serde(default)]
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

impl YFinanceClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .pool_max_idle_per_host(10)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: YFINANCE_API_BASE.to_string(),
        })
    }

    /// The wire interval; h4 is derived from 1h after the fetch.
    fn map_timeframe(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M15 => "15m",
            Timeframe::H1 | Timeframe::H4 => "1h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1wk",
        }
    }
}

fn normalize(result: ChartResult) -> Vec<ProviderBar> {
    let timestamps = result.timestamp.unwrap_or_default();
    let Some(quote) = result.indicators.quote.into_iter().next() else {
        return Vec::new();
    };

    let mut bars = Vec::with_capacity(timestamps.len());
    for (i, ts) in timestamps.iter().enumerate() {
        let Some(ts) = DateTime::from_timestamp(*ts, 0) else {
            continue;
        };
        // Yahoo pads thin sessions with nulls; skip incomplete rows.
        let (Some(open), Some(high), Some(low), Some(close)) = (
            quote.open.get(i).copied().flatten(),
            quote.high.get(i).copied().flatten(),
            quote.low.get(i).copied().flatten(),
            quote.close.get(i).copied().flatten(),
        ) else {
            continue;
        };
        bars.push(ProviderBar {
            ts,
            open,
            high,
            low,
            close,
            volume: quote
                .volume
                .get(i)
                .copied()
                .flatten()
                .map(|v| v.round().max(0.0) as u64)
                .unwrap_or(0),
        });
    }
    bars
}

/// Roll 1h bars up onto the UTC 4-hour grid.
fn rollup_h4(h1: Vec<ProviderBar>) -> Vec<ProviderBar> {
    let mut buckets: BTreeMap<i64, Vec<ProviderBar>> = BTreeMap::new();
    for bar in h1 {
        let start = bucket_start(bar.ts, Timeframe::H4);
        buckets.entry(start.timestamp()).or_default().push(bar);
    }

    let mut out = Vec::with_capacity(buckets.len());
    for (bucket_ts, mut members) in buckets {
        members.sort_by_key(|b| b.ts);
        let (Some(first), Some(last)) = (members.first(), members.last()) else {
            continue;
        };
        let Some(ts) = DateTime::from_timestamp(bucket_ts, 0) else {
            continue;
        };
        out.push(ProviderBar {
            ts,
            open: first.open,
            high: members.iter().map(|b| b.high).fold(f64::MIN, f64::max),
            low: members.iter().map(|b| b.low).fold(f64::MAX, f64::min),
            close: last.close,
            volume: members.iter().map(|b| b.volume).sum(),
        });
    }
    out
}

#[async_trait]
impl MarketDataProvider for YFinanceClient {
    fn id(&self) -> ProviderId {
        ProviderId::Yfinance
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarBatch, ProviderError> {
        let url = format!("{}/v8/finance/chart/{}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("period1", from.timestamp().to_string()),
                ("period2", to.timestamp().to_string()),
                ("interval", Self::map_timeframe(timeframe).to_string()),
                ("includePrePost", "false".to_string()),
            ])
            .send()
            .await
            .map_err(classify_request_error)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let parsed: ChartResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("yfinance response parse: {}", e)))?;

        if let Some(err) = parsed.chart.error {
            let code = err.code.unwrap_or_default();
            if code.eq_ignore_ascii_case("not found") {
                return Err(ProviderError::NotFound);
            }
            return Err(ProviderError::Permanent(format!(
                "yfinance error {}: {}",
                code,
                err.description.unwrap_or_default()
            )));
        }

        let Some(result) = parsed.chart.result.and_then(|r| r.into_iter().next()) else {
            return Err(ProviderError::NotFound);
        };

        let mut bars = normalize(result);
        if timeframe == Timeframe::H4 {
            bars = rollup_h4(bars);
        }
        if bars.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(BarBatch {
            provider: ProviderId::Yfinance,
            bars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn chart_json(timestamps: &str, open: &str, high: &str, low: &str, close: &str, volume: &str) -> String {
        format!(
            r#"{{"chart":{{"result":[{{"meta":{{"symbol":"AAPL"}},"timestamp":{timestamps},
                "indicators":{{"quote":[{{"open":{open},"high":{high},"low":{low},"close":{close},"volume":{volume}}}]}}}}],
                "error":null}}}}"#
        )
    }

    #[test]
    fn timeframe_mapping_derives_h4_from_1h() {
        assert_eq!(YFinanceClient::map_timeframe(Timeframe::M15), "15m");
        assert_eq!(YFinanceClient::map_timeframe(Timeframe::H1), "1h");
        assert_eq!(YFinanceClient::map_timeframe(Timeframe::H4), "1h");
        assert_eq!(YFinanceClient::map_timeframe(Timeframe::D1), "1d");
        assert_eq!(YFinanceClient::map_timeframe(Timeframe::W1), "1wk");
    }

    #[test]
    fn parses_chart_payload_and_skips_null_rows() {
        let raw = chart_json(
            "[1709287200,1709290800,1709294400]",
            "[74.0,null,75.0]",
            "[74.5,null,75.5]",
            "[73.5,null,74.8]",
            "[74.2,null,75.2]",
            "[1000,null,2000]",
        );
        let parsed: ChartResponse = serde_json::from_str(&raw).unwrap();
        let result = parsed.chart.result.unwrap().into_iter().next().unwrap();
        let bars = normalize(result);
        assert_eq!(bars.len(), 2);
        assert_eq!(
            bars[0].ts,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(bars[1].volume, 2000);
    }

    #[test]
    fn h4_rollup_composes_ohlcv() {
        // Four 1h bars inside the 08:00-12:00 UTC bucket.
        let h1: Vec<ProviderBar> = (0..4)
            .map(|i| ProviderBar {
                ts: Utc.with_ymd_and_hms(2024, 3, 1, 8 + i, 0, 0).unwrap(),
                open: 10.0 + i as f64,
                high: 20.0 + i as f64,
                low: 5.0 - i as f64,
                close: 15.0 + i as f64,
                volume: 100,
            })
            .collect();
        let h4 = rollup_h4(h1);
        assert_eq!(h4.len(), 1);
        let bar = &h4[0];
        assert_eq!(bar.ts, Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap());
        assert!((bar.open - 10.0).abs() < 1e-9);
        assert!((bar.high - 23.0).abs() < 1e-9);
        assert!((bar.low - 2.0).abs() < 1e-9);
        assert!((bar.close - 18.0).abs() < 1e-9);
        assert_eq!(bar.volume, 400);
    }

    #[test]
    fn yahoo_error_envelope_parses() {
        let raw = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        let parsed: ChartResponse = serde_json::from_str(raw).unwrap();
        let err = parsed.chart.error.unwrap();
        assert_eq!(err.code.as_deref(), Some("Not Found"));
    }
}
