//! Tradier timesales client.
//!
//! Intraday fallback only: serves today's m15 bars when Alpaca is rate
//! limited or down. Tradier has no hourly timesales interval, so any
//! larger timeframe is refused; h1/h4 for today resolve from m15 in the
//! chart aggregator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::America::New_York;
use reqwest::Client;
use serde::Deserialize;

use super::{
    classify_request_error, error_from_response, BarBatch, MarketDataProvider, ProviderBar,
    ProviderError, PROVIDER_TIMEOUT,
};
use crate::models::{ProviderId, Timeframe};

const TRADIER_API_BASE: &str = "https://api.tradier.com";

#[derive(Clone)]
pub struct TradierClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TimesalesResponse {
    #[serde(default)]
    series: Option<TimesalesSeries>,
}

#[derive(Debug, Deserialize)]
struct TimesalesSeries {
    #[serde(default)]
    data: Option<OneOrMany<TimesalesPoint>>,
}

/// Tradier collapses single-element arrays to a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TimesalesPoint {
    /// Unix seconds.
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: Option<f64>,
}

impl TradierClient {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", api_key).parse()?,
        );
        headers.insert(reqwest::header::ACCEPT, "application/json".parse()?);

        let client = Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .pool_max_idle_per_host(10)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: TRADIER_API_BASE.to_string(),
        })
    }

    /// Tradier expects local Eastern wall-clock bounds.
    fn et_param(ts: DateTime<Utc>) -> String {
        ts.with_timezone(&New_York)
            .format("%Y-%m-%d %H:%M")
            .to_string()
    }
}

fn normalize(points: Vec<TimesalesPoint>) -> Vec<ProviderBar> {
    points
        .into_iter()
        .filter_map(|p| {
            let ts = DateTime::from_timestamp(p.timestamp, 0)?;
            Some(ProviderBar {
                ts,
                open: p.open,
                high: p.high,
                low: p.low,
                close: p.close,
                volume: p.volume.map(|v| v.round().max(0.0) as u64).unwrap_or(0),
            })
        })
        .collect()
}

#[async_trait]
impl MarketDataProvider for TradierClient {
    fn id(&self) -> ProviderId {
        ProviderId::Tradier
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarBatch, ProviderError> {
        if timeframe != Timeframe::M15 {
            return Err(ProviderError::BadRequest(format!(
                "tradier timesales serves m15 only, not {}",
                timeframe.as_str()
            )));
        }

        let url = format!("{}/v1/markets/timesales", self.base_url);
        let start = Self::et_param(from);
        let end = Self::et_param(to);
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol),
                ("interval", "15min"),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("session_filter", "open"),
            ])
            .send()
            .await
            .map_err(classify_request_error)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let parsed: TimesalesResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("tradier response parse: {}", e)))?;

        let bars = normalize(
            parsed
                .series
                .and_then(|s| s.data)
                .map(OneOrMany::into_vec)
                .unwrap_or_default(),
        );
        if bars.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(BarBatch {
            provider: ProviderId::Tradier,
            bars,
        })
    }
}
