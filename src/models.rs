//! Core domain types shared across the ingestion pipeline.
//!
//! Everything that crosses a component boundary lives here: canonical
//! timeframes, provider identities, job/run enums, the bar record, and the
//! process-wide `Config` loaded from the environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical bar timeframes. Adapters map these to provider-specific strings
/// internally; call sites never see a provider spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    M15,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
        Timeframe::W1,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M15 => "m15",
            Timeframe::H1 => "h1",
            Timeframe::H4 => "h4",
            Timeframe::D1 => "d1",
            Timeframe::W1 => "w1",
        }
    }

    pub fn parse_str(s: &str) -> Option<Timeframe> {
        match s {
            "m15" => Some(Timeframe::M15),
            "h1" => Some(Timeframe::H1),
            "h4" => Some(Timeframe::H4),
            "d1" => Some(Timeframe::D1),
            "w1" => Some(Timeframe::W1),
            _ => None,
        }
    }

    /// Duration of one bar in seconds.
    pub fn step_secs(&self) -> i64 {
        match self {
            Timeframe::M15 => 900,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
        }
    }

    /// Approximate bars per US equity session, used to size chart windows.
    pub fn bars_per_day(&self) -> f64 {
        match self {
            Timeframe::M15 => 26.0,
            Timeframe::H1 => 7.0,
            Timeframe::H4 => 2.0,
            Timeframe::D1 => 1.0,
            Timeframe::W1 => 0.2,
        }
    }

    /// Default lookback window for new job definitions.
    pub fn default_window_days(&self) -> i64 {
        match self {
            Timeframe::M15 => 7,
            Timeframe::H1 => 30,
            Timeframe::H4 => 60,
            Timeframe::D1 => 365,
            Timeframe::W1 => 730,
        }
    }

    pub fn is_intraday_class(&self) -> bool {
        matches!(self, Timeframe::M15 | Timeframe::H1 | Timeframe::H4)
    }
}

/// Where a bar came from. `MlForecast` is the internal forecast writer; the
/// other four are external market-data providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Alpaca,
    Polygon,
    Tradier,
    Yfinance,
    MlForecast,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Alpaca => "alpaca",
            ProviderId::Polygon => "polygon",
            ProviderId::Tradier => "tradier",
            ProviderId::Yfinance => "yfinance",
            ProviderId::MlForecast => "ml_forecast",
        }
    }

    pub fn parse_str(s: &str) -> Option<ProviderId> {
        match s {
            "alpaca" => Some(ProviderId::Alpaca),
            "polygon" => Some(ProviderId::Polygon),
            "tradier" => Some(ProviderId::Tradier),
            "yfinance" => Some(ProviderId::Yfinance),
            "ml_forecast" => Some(ProviderId::MlForecast),
            _ => None,
        }
    }

    /// Deduplication rank when several providers cover the same bar key.
    /// Lower wins. Intraday reads rank tradier ahead of yfinance, which
    /// never writes today's bars.
    pub fn priority_rank(&self, intraday: bool) -> u8 {
        match (self, intraday) {
            (ProviderId::Polygon, _) => 0,
            (ProviderId::Alpaca, _) => 1,
            (ProviderId::Yfinance, false) => 2,
            (ProviderId::Tradier, false) => 3,
            (ProviderId::Tradier, true) => 2,
            (ProviderId::Yfinance, true) => 9,
            (ProviderId::MlForecast, _) => 10,
        }
    }
}

/// What a job definition keeps fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FetchIntraday,
    FetchHistorical,
    RunForecast,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FetchIntraday => "fetch_intraday",
            JobKind::FetchHistorical => "fetch_historical",
            JobKind::RunForecast => "run_forecast",
        }
    }

    pub fn parse_str(s: &str) -> Option<JobKind> {
        match s {
            "fetch_intraday" => Some(JobKind::FetchIntraday),
            "fetch_historical" => Some(JobKind::FetchHistorical),
            "run_forecast" => Some(JobKind::RunForecast),
            _ => None,
        }
    }
}

/// Job run lifecycle. Only `queued -> running` is an atomic claim; the rest
/// are terminal transitions or the requeue edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse_str(s: &str) -> Option<RunStatus> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Quality tag carried on every bar row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataStatus {
    Verified,
    Live,
    Provisional,
}

impl DataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataStatus::Verified => "verified",
            DataStatus::Live => "live",
            DataStatus::Provisional => "provisional",
        }
    }

    pub fn parse_str(s: &str) -> Option<DataStatus> {
        match s {
            "verified" => Some(DataStatus::Verified),
            "live" => Some(DataStatus::Live),
            "provisional" => Some(DataStatus::Provisional),
            _ => None,
        }
    }
}

/// One OHLCV record. Prices are 4-decimal fixed point (`value * 10_000`);
/// the JSON surface converts back to floats at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub ts: DateTime<Utc>,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: u64,
    pub provider: ProviderId,
    pub is_intraday: bool,
    pub is_forecast: bool,
    pub data_status: DataStatus,
    pub confidence_score: Option<f64>,
    pub upper_band: Option<i64>,
    pub lower_band: Option<i64>,
    pub fetched_at: DateTime<Utc>,
}

/// Scale factor for fixed-point prices.
pub const PRICE_SCALE: f64 = 10_000.0;

/// Round a float price to 4-decimal fixed point.
pub fn fixed4_from_f64(v: f64) -> i64 {
    (v * PRICE_SCALE).round() as i64
}

pub fn fixed4_to_f64(v: i64) -> f64 {
    v as f64 / PRICE_SCALE
}

/// A `[from, to]` interval on the time axis, inclusive at the bar-timestamp
/// level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,

    pub alpaca_api_key: Option<String>,
    pub alpaca_api_secret: Option<String>,
    pub polygon_api_key: Option<String>,
    pub tradier_api_key: Option<String>,

    /// Per-provider bucket overrides, tokens per minute (capacity = refill).
    pub finnhub_rpm_override: Option<f64>,
    pub massive_rpm_override: Option<f64>,

    pub cache_ttl_quote: u64,
    pub cache_ttl_bars: u64,
    pub cache_ttl_news: u64,
    pub cache_ttl_fundamentals: u64,
    pub cache_ttl_symbols: u64,

    pub max_concurrent_workers: usize,
    pub max_attempts: u32,
    pub stuck_run_timeout_secs: i64,
    pub run_retention_days: i64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DB_PATH")
            .or_else(|_| std::env::var("DATABASE_PATH"))
            .unwrap_or_else(|_| "./barfeed.db".to_string());

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3000);

        // MASSIVE_API_KEY is the legacy name for the Polygon key.
        let polygon_api_key = std::env::var("POLYGON_API_KEY")
            .or_else(|_| std::env::var("MASSIVE_API_KEY"))
            .ok()
            .filter(|v| !v.trim().is_empty());

        Self {
            database_path,
            port,
            alpaca_api_key: non_empty_env("ALPACA_API_KEY"),
            alpaca_api_secret: non_empty_env("ALPACA_API_SECRET"),
            polygon_api_key,
            tradier_api_key: non_empty_env("TRADIER_API_KEY"),
            finnhub_rpm_override: rpm_override("FINNHUB_MAX_RPM", "FINNHUB_MAX_RPS"),
            massive_rpm_override: rpm_override("MASSIVE_MAX_RPM", "MASSIVE_MAX_RPS"),
            cache_ttl_quote: ttl_env("CACHE_TTL_QUOTE", 5),
            cache_ttl_bars: ttl_env("CACHE_TTL_BARS", 30),
            cache_ttl_news: ttl_env("CACHE_TTL_NEWS", 300),
            cache_ttl_fundamentals: ttl_env("CACHE_TTL_FUNDAMENTALS", 3_600),
            cache_ttl_symbols: ttl_env("CACHE_TTL_SYMBOLS", 86_400),
            max_concurrent_workers: std::env::var("ORCHESTRATOR_MAX_CONCURRENT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(5),
            max_attempts: std::env::var("ORCHESTRATOR_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(5),
            stuck_run_timeout_secs: std::env::var("STUCK_RUN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(600),
            run_retention_days: std::env::var("RUN_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&v| v > 0)
                .unwrap_or(14),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn ttl_env(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Bucket overrides accept either a per-minute figure or a per-second figure
/// (scaled by 60). Per-minute wins when both are set.
fn rpm_override(rpm_key: &str, rps_key: &str) -> Option<f64> {
    let rpm = std::env::var(rpm_key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|&v| v > 0.0);
    if rpm.is_some() {
        return rpm;
    }
    std::env::var(rps_key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|&v| v > 0.0)
        .map(|v| v * 60.0)
}
