//! Polygon aggregates client.
//!
//! Second choice for historical fetches; the free tier's 5 requests per
//! minute is why the bucket defaults are so small.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;

use super::{
    classify_request_error, error_from_response, BarBatch, MarketDataProvider, ProviderBar,
    ProviderError, PROVIDER_TIMEOUT,
};
use crate::models::{ProviderId, Timeframe};

const POLYGON_API_BASE: &str = "https://api.polygon.io";

#[derive(Clone)]
pub struct PolygonClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct PolygonAggsResponse {
    #[serde(default)]
    results: Option<Vec<PolygonAgg>>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PolygonAgg {
    /// Bar start in unix milliseconds.
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: Option<f64>,
}

impl PolygonClient {
    pub fn new(api_key: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .pool_max_idle_per_host(10)
            .build()?;
        Ok(Self {
            client,
            base_url: POLYGON_API_BASE.to_string(),
            api_key,
        })
    }

    fn map_timeframe(timeframe: Timeframe) -> (u32, &'static str) {
        match timeframe {
            Timeframe::M15 => (15, "minute"),
            Timeframe::H1 => (1, "hour"),
            Timeframe::H4 => (4, "hour"),
            Timeframe::D1 => (1, "day"),
            Timeframe::W1 => (1, "week"),
        }
    }
}

fn normalize(results: Vec<PolygonAgg>) -> Vec<ProviderBar> {
    results
        .into_iter()
        .filter_map(|a| {
            let ts = DateTime::from_timestamp_millis(a.t)?;
            Some(ProviderBar {
                ts,
                open: a.o,
                high: a.h,
                low: a.l,
                close: a.c,
                volume: a.v.map(|v| v.round().max(0.0) as u64).unwrap_or(0),
            })
        })
        .collect()
}

#[async_trait]
impl MarketDataProvider for PolygonClient {
    fn id(&self) -> ProviderId {
        ProviderId::Polygon
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarBatch, ProviderError> {
        let (multiplier, span) = Self::map_timeframe(timeframe);
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url,
            symbol,
            multiplier,
            span,
            from.timestamp_millis(),
            to.timestamp_millis(),
        );

        let resp = self
            .client
            .get(&url)
            .query(&[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", "50000"),
                ("apiKey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(classify_request_error)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let parsed: PolygonAggsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Permanent(format!("polygon response parse: {}", e)))?;

        if matches!(parsed.status.as_deref(), Some("ERROR")) {
            return Err(ProviderError::Permanent("polygon status ERROR".to_string()));
        }

        let bars = normalize(parsed.results.unwrap_or_default());
        if bars.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(BarBatch {
            provider: ProviderId::Polygon,
            bars,
        })
    }
}
