//! Market-data provider adapters and routing.
//!
//! Each adapter turns the canonical (symbol, timeframe, from, to) request
//! into the provider's wire format and normalizes the response to UTC
//! timestamps, float OHLC and integer volume. Provider-specific timeframe
//! strings never leave the adapter. Errors are classified into the taxonomy
//! the worker routes on: only `RateLimited` and `Transient` advance the
//! router to the next provider.

pub mod alpaca;
pub mod polygon;
pub mod tradier;
pub mod yfinance;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::models::{Config, JobKind, ProviderId, Timeframe};

pub use alpaca::AlpacaClient;
pub use polygon::PolygonClient;
pub use tradier::TradierClient;
pub use yfinance::YFinanceClient;

/// Per-request deadline, kept under the 30 s handler ceiling.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(29);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<u64> },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Stable code persisted on failed runs.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Auth(_) => "auth_error",
            ProviderError::NotFound => "not_found",
            ProviderError::BadRequest(_) => "bad_request",
            ProviderError::Transient(_) => "transient",
            ProviderError::Permanent(_) => "permanent",
        }
    }

    /// Should the router try the next provider?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }
}

/// Map an HTTP status to the taxonomy. 404 maps to `NotFound`; adapters
/// also map structurally-empty bodies to `NotFound` themselves.
pub fn classify_status(status: u16, retry_after: Option<u64>, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Auth(truncate(body, 200)),
        404 => ProviderError::NotFound,
        429 => ProviderError::RateLimited { retry_after },
        400 | 422 => ProviderError::BadRequest(truncate(body, 200)),
        500..=599 => ProviderError::Transient(format!("HTTP {}: {}", status, truncate(body, 200))),
        _ => ProviderError::Permanent(format!("HTTP {}: {}", status, truncate(body, 200))),
    }
}

/// Network-level failures are transient by definition.
pub fn classify_request_error(e: reqwest::Error) -> ProviderError {
    ProviderError::Transient(e.to_string())
}

/// Drain a non-success response into a classified error.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok());
    let body = resp.text().await.unwrap_or_default();
    classify_status(status, retry_after, &body)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// One normalized bar straight off the wire: UTC timestamp, float prices
/// (rounded to 4 decimals at the store boundary), integer volume.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderBar {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BarBatch {
    pub provider: ProviderId,
    pub bars: Vec<ProviderBar>,
}

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BarBatch, ProviderError>;
}

/// Static routing preference per job kind. Workers walk this list, skipping
/// providers without credentials and advancing past retryable failures.
pub fn route_candidates(kind: JobKind) -> &'static [ProviderId] {
    match kind {
        JobKind::FetchIntraday => &[ProviderId::Alpaca, ProviderId::Tradier],
        JobKind::FetchHistorical => &[
            ProviderId::Alpaca,
            ProviderId::Polygon,
            ProviderId::Yfinance,
        ],
        // Forecasts are produced by the external ML pipeline, not fetched.
        JobKind::RunForecast => &[],
    }
}

/// The configured adapters, keyed by provider.
#[derive(Clone, Default)]
pub struct ProviderSet {
    adapters: HashMap<ProviderId, Arc<dyn MarketDataProvider>>,
}

impl ProviderSet {
    /// Build adapters for every provider with usable credentials. YFinance
    /// is keyless and always present.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let mut adapters: HashMap<ProviderId, Arc<dyn MarketDataProvider>> = HashMap::new();

        if let (Some(key), Some(secret)) = (&config.alpaca_api_key, &config.alpaca_api_secret) {
            adapters.insert(
                ProviderId::Alpaca,
                Arc::new(AlpacaClient::new(key.clone(), secret.clone())?),
            );
            info!("🔌 Alpaca adapter configured");
        }
        if let Some(key) = &config.polygon_api_key {
            adapters.insert(ProviderId::Polygon, Arc::new(PolygonClient::new(key.clone())?));
            info!("🔌 Polygon adapter configured");
        }
        if let Some(key) = &config.tradier_api_key {
            adapters.insert(ProviderId::Tradier, Arc::new(TradierClient::new(key.clone())?));
            info!("🔌 Tradier adapter configured");
        }
        adapters.insert(ProviderId::Yfinance, Arc::new(YFinanceClient::new()?));

        Ok(Self { adapters })
    }

    /// Explicit adapter set, the seam tests use to inject mocks.
    pub fn with_adapters(list: Vec<Arc<dyn MarketDataProvider>>) -> Self {
        let mut adapters = HashMap::new();
        for adapter in list {
            adapters.insert(adapter.id(), adapter);
        }
        Self { adapters }
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn MarketDataProvider>> {
        self.adapters.get(&id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
