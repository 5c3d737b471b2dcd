pub mod scheduler;
pub mod tick;
pub mod worker;

pub use tick::{run_tick, split_gap_into_slices, TickSummary};
pub use worker::{execute_run, run_one_worker};
