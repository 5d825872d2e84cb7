mod queue;
mod worker;

pub use queue::{print_failed, print_stats};
pub use worker::run_worker;
