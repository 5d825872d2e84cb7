use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_QUEUE_NAME, DEFAULT_WORKER_CONCURRENCY};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Settings {
    pub redis_url: String,
    pub queues: Vec<String>,
    /// Per-queue worker count unless overridden in `queue_concurrency`.
    pub concurrency: usize,
    pub queue_concurrency: HashMap<String, usize>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            queues: vec![DEFAULT_QUEUE_NAME.to_string()],
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            queue_concurrency: HashMap::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.queue_concurrency
            .get(queue)
            .copied()
            .unwrap_or(self.concurrency)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_for_prefers_the_per_queue_override() {
        let mut settings = Settings::default();
        settings.concurrency = 4;
        settings.queue_concurrency.insert("mailers".to_string(), 12);
        assert_eq!(settings.concurrency_for("mailers"), 12);
        assert_eq!(settings.concurrency_for("default"), 4);
    }

    #[test]
    fn concurrency_for_never_returns_zero() {
        let mut settings = Settings::default();
        settings.concurrency = 0;
        settings.queue_concurrency.insert("stuck".to_string(), 0);
        assert_eq!(settings.concurrency_for("stuck"), 1);
        assert_eq!(settings.concurrency_for("default"), 1);
    }
}
