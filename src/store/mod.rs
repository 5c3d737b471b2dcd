pub mod bar_store;
pub mod catalog;
pub mod checkpoints;
pub mod coverage;
pub mod db;
pub mod queue;
pub mod rate_limiter;

pub use bar_store::{BarStore, BarValidationError, ChartBars, Layers, UpsertReport};
pub use catalog::{JobCatalog, JobDefinition};
pub use checkpoints::ProviderCheckpoints;
pub use coverage::{CoverageLedger, CoverageRow};
pub use db::Db;
pub use queue::{slice_hash, ClaimedRun, JobQueue, RunRecord};
pub use rate_limiter::{BucketStatus, RateLimiter};
