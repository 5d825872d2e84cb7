pub mod client;
pub mod config;
pub mod constants;
pub mod cron;
pub mod job;
pub mod registry;
pub mod settings;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use client::Client;
pub use cron::{CronEntry, CronExpression, CronRegistry, next_run};
pub use job::{FailedJob, JobDescriptor};
pub use registry::{Handler, HandlerRegistry, HandlerSpec, default_retry_delay};
pub use settings::Settings;
pub use store::{QueueStats, QueueStore};
pub use worker::Worker;
