//! Application state shared across handlers, workers and background tasks.

use std::sync::Arc;

use crate::api::cache::ResponseCache;
use crate::models::Config;
use crate::providers::ProviderSet;
use crate::store::{
    BarStore, CoverageLedger, Db, JobCatalog, JobQueue, ProviderCheckpoints, RateLimiter,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub bars: BarStore,
    pub coverage: CoverageLedger,
    pub catalog: JobCatalog,
    pub queue: JobQueue,
    pub rate: RateLimiter,
    pub checkpoints: ProviderCheckpoints,
    pub providers: ProviderSet,
    pub chart_cache: ResponseCache,
    /// Tick-level exclusion: at most one orchestrator tick runs at a time.
    pub tick_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(config: Config, db: Db, providers: ProviderSet) -> Self {
        let chart_cache = ResponseCache::new(config.cache_ttl_bars);
        Self {
            config,
            bars: BarStore::new(db.clone()),
            coverage: CoverageLedger::new(db.clone()),
            catalog: JobCatalog::new(db.clone()),
            queue: JobQueue::new(db.clone()),
            rate: RateLimiter::new(db.clone()),
            checkpoints: ProviderCheckpoints::new(db),
            providers,
            chart_cache,
            tick_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}
