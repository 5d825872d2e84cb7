use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::settings::Settings;
use crate::store::QueueStore;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Serializes Redis-backed tests onto a flushed test database with a
/// uuid-suffixed queue name per context.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub settings: Settings,
    pub store: QueueStore,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let mut settings = Settings::default();
        settings.redis_url = std::env::var("REDQ_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        settings.queues = vec![format!("test-{}", Uuid::new_v4())];
        let mut store = QueueStore::connect(&settings.redis_url).await?;
        store.flushdb().await?;
        Ok(Self {
            _guard: guard,
            settings,
            store,
        })
    }

    pub fn queue(&self) -> &str {
        &self.settings.queues[0]
    }
}
