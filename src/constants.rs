use std::time::Duration;

pub const QUEUE_KEY_PREFIX: &str = "queue:";
pub const SCHEDULE_KEY_PREFIX: &str = "schedule:";
pub const PROCESSING_KEY_PREFIX: &str = "processing:";
pub const FAILED_KEY: &str = "failed";
pub const CRON_JOBS_KEY: &str = "cron:jobs";
pub const CRON_SCHEDULE_KEY: &str = "cron:schedule";
pub const CRON_NEXT_RUN_PREFIX: &str = "cron:next_run:";

pub const DEFAULT_QUEUE_NAME: &str = "default";
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_JOB_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 10;

pub const POP_TIMEOUT_SECONDS: f64 = 1.0;
pub const PROMOTER_TICK: Duration = Duration::from_secs(1);
pub const POLL_ERROR_DELAY: Duration = Duration::from_secs(1);

pub const MAX_BACKTRACE_FRAMES: usize = 10;
