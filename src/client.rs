use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::job::{JobDescriptor, now_secs};
use crate::registry::HandlerRegistry;
use crate::store::QueueStore;

/// Producer surface: writes descriptors for registered job classes onto
/// their configured queue, immediately or deferred.
#[derive(Clone)]
pub struct Client {
    store: QueueStore,
    registry: Arc<HandlerRegistry>,
}

impl Client {
    pub fn new(store: QueueStore, registry: Arc<HandlerRegistry>) -> Self {
        Self { store, registry }
    }

    pub async fn enqueue(&mut self, class: &str, args: Vec<Value>) -> Result<JobDescriptor> {
        let queue = self.queue_of(class)?;
        let job = JobDescriptor::new(class, args);
        self.store.push(&queue, &job).await?;
        tracing::debug!(class, queue = %queue, "job enqueued");
        Ok(job)
    }

    pub async fn enqueue_in(
        &mut self,
        delay_seconds: f64,
        class: &str,
        args: Vec<Value>,
    ) -> Result<JobDescriptor> {
        self.enqueue_at(now_secs() + delay_seconds, class, args).await
    }

    pub async fn enqueue_at(
        &mut self,
        at: f64,
        class: &str,
        args: Vec<Value>,
    ) -> Result<JobDescriptor> {
        let queue = self.queue_of(class)?;
        let job = JobDescriptor::new(class, args);
        self.store.schedule(&queue, &job, at).await?;
        tracing::debug!(class, queue = %queue, at, "job scheduled");
        Ok(job)
    }

    fn queue_of(&self, class: &str) -> Result<String> {
        self.registry
            .queue_of(class)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("job class '{class}' is not registered"))
    }
}
