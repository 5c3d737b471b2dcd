//! Alpaca Market Data v2 client.
//!
//! Preferred provider for both intraday and historical fetches. Pages
//! through `next_page_token` until the window is drained.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{
    classify_request_error, error_from_response, BarBatch, MarketDataProvider, ProviderBar,
    ProviderError, PROVIDER_TIMEOUT,
};
use crate::models::{ProviderId, Timeframe};

const ALPACA_DATA_BASE: &str = "https://data.alpaca.markets";
const PAGE_LIMIT: u32 = 10_000;
const MAX_PAGES: u32 = 50;

#[derive(Clone)]
pub struct AlpacaClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct AlpacaBarsResponse {
    #[serde(default)]
    bars: Option<Vec<AlpacaBar>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: DateTime<Utc>,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: Option<f64>,
}

impl AlpacaClient {
    pub fn new(api_key: String, api_secret: String) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("APCA-API-KEY-ID", api_key.parse()?);
        headers.insert("APCA-API-SECRET-KEY", api_secret.parse()?);

        let client = Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .pool_max_idle_per_host(10)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: ALPACA_DATA_BASE.to_string(),
        })
    }

    fn map_timeframe(timeframe: Timeframe) -> &'static str {
        match timeframe {
            Timeframe::M15 => "15Min",
            Timeframe::H1 => "1Hour",
            Timeframe::H4 => "4Hour",
            Timeframe::D1 => "1Day",
            Timeframe::W1 => "1Week",
        }
    }
}

fn normalize(bars: Vec<AlpacaBar>) -> Vec<ProviderBar> {
    bars.into_iter()
        .map(|b| ProviderBar {
            ts: b.t,
            open: b.o,
            high: b.h,
            low: b.l,
            close: b.c,
            volume: b.v.map(|v| v.round().max(0.0) as u64).unwrap_or(0),
        })
        .collect()
}

#[async_trait]
impl MarketDataProvider for AlpacaClient {
    fn id(&self) -> ProviderId {
        ProviderId::Alpaca
    }

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarBatch, ProviderError> {
        let url = format!("{}/v2/stocks/{}/bars", self.base_url, symbol);
        let mut bars: Vec<ProviderBar> = Vec::new();
        let mut page_token: Option<String> = None;

        for _page in 0..MAX_PAGES {
            let mut qp: Vec<(String, String)> = vec![
                (
                    "timeframe".to_string(),
                    Self::map_timeframe(timeframe).to_string(),
                ),
                (
                    "start".to_string(),
                    from.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                (
                    "end".to_string(),
                    to.to_rfc3339_opts(SecondsFormat::Secs, true),
                ),
                ("limit".to_string(), PAGE_LIMIT.to_string()),
                ("adjustment".to_string(), "raw".to_string()),
            ];
            if let Some(token) = &page_token {
                qp.push(("page_token".to_string(), token.clone()));
            }

            let resp = self
                .client
                .get(&url)
                .query(&qp)
                .send()
                .await
                .map_err(classify_request_error)?;

            if !resp.status().is_success() {
                return Err(error_from_response(resp).await);
            }

            let parsed: AlpacaBarsResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::Permanent(format!("alpaca response parse: {}", e)))?;

            let page = parsed.bars.unwrap_or_default();
            let page_len = page.len();
            bars.extend(normalize(page));

            page_token = parsed.next_page_token;
            if page_token.is_none() || page_len < PAGE_LIMIT as usize {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        if bars.is_empty() {
            return Err(ProviderError::NotFound);
        }
        Ok(BarBatch {
            provider: ProviderId::Alpaca,
            bars,
        })
    }
}
