use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio::time::Duration;

use crate::constants::{DEFAULT_JOB_TIMEOUT_SECONDS, DEFAULT_MAX_RETRIES};

/// User-supplied job code. A fresh instance is produced for every
/// invocation; cron jobs are invoked with an empty argument list.
#[async_trait]
pub trait Handler: Send {
    async fn perform(&mut self, args: Vec<Value>) -> Result<()>;
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn Handler> + Send + Sync>;

pub type RetryDelayFn = Arc<dyn Fn(u32) -> f64 + Send + Sync>;

/// Static per-class metadata. `retry_delay` must be a pure function of the
/// attempt index returning non-negative finite seconds.
#[derive(Clone)]
pub struct HandlerSpec {
    pub queue: String,
    pub max_retries: u32,
    pub timeout: Duration,
    pub priority_retry: bool,
    pub retry_delay: RetryDelayFn,
}

impl HandlerSpec {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECONDS),
            priority_retry: false,
            retry_delay: Arc::new(default_retry_delay),
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn priority_retry(mut self, priority_retry: bool) -> Self {
        self.priority_retry = priority_retry;
        self
    }

    pub fn retry_delay(mut self, delay: impl Fn(u32) -> f64 + Send + Sync + 'static) -> Self {
        self.retry_delay = Arc::new(delay);
        self
    }
}

pub fn default_retry_delay(attempt: u32) -> f64 {
    let base = 2f64.powi(attempt.min(30) as i32);
    base + rand::rng().random_range(0.0..10.0)
}

struct Registration {
    spec: HandlerSpec,
    factory: HandlerFactory,
}

/// Explicit class-name registry: every handler is registered by the
/// embedding process at startup, no auto-discovery.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<Registration>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H, F>(&mut self, class: impl Into<String>, spec: HandlerSpec, factory: F)
    where
        H: Handler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.handlers.insert(
            class.into(),
            Arc::new(Registration {
                spec,
                factory: Arc::new(move || Box::new(factory())),
            }),
        );
    }

    /// The class metadata together with a fresh handler instance.
    pub fn resolve(&self, class: &str) -> Option<(HandlerSpec, Box<dyn Handler>)> {
        self.handlers
            .get(class)
            .map(|registration| (registration.spec.clone(), (registration.factory)()))
    }

    pub fn spec(&self, class: &str) -> Option<&HandlerSpec> {
        self.handlers.get(class).map(|registration| &registration.spec)
    }

    pub fn queue_of(&self, class: &str) -> Option<&str> {
        self.spec(class).map(|spec| spec.queue.as_str())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Handler for Counter {
        async fn perform(&mut self, _args: Vec<Value>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn default_retry_delay_is_exponential_with_bounded_jitter() {
        for attempt in 1..=10 {
            let base = 2f64.powi(attempt as i32);
            for _ in 0..50 {
                let delay = default_retry_delay(attempt);
                assert!(delay.is_finite());
                assert!(delay >= base, "delay {delay} below base {base}");
                assert!(delay < base + 10.0, "delay {delay} above jitter bound");
            }
        }
    }

    #[test]
    fn default_retry_delay_caps_the_exponent() {
        let delay = default_retry_delay(u32::MAX);
        assert!(delay.is_finite());
        assert!(delay >= 0.0);
    }

    #[tokio::test]
    async fn registry_resolves_fresh_instances_with_metadata() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        let factory_calls = calls.clone();
        registry.register(
            "Counter",
            HandlerSpec::new("critical")
                .max_retries(1)
                .timeout(Duration::from_secs(5))
                .priority_retry(true),
            move || Counter {
                calls: factory_calls.clone(),
            },
        );

        assert_eq!(registry.queue_of("Counter"), Some("critical"));
        assert_eq!(registry.queue_of("Other"), None);
        assert!(registry.resolve("Other").is_none());

        let (spec, mut handler) = registry.resolve("Counter").unwrap();
        assert_eq!(spec.max_retries, 1);
        assert_eq!(spec.timeout, Duration::from_secs(5));
        assert!(spec.priority_retry);
        handler.perform(vec![]).await.unwrap();

        let (_, mut other) = registry.resolve("Counter").unwrap();
        other.perform(vec![]).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn custom_retry_delay_is_used() {
        let spec = HandlerSpec::new("default").retry_delay(|attempt| 0.5 * attempt as f64);
        assert_eq!((spec.retry_delay)(4), 2.0);
    }
}
