use std::collections::HashMap;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::{Result, anyhow};
use async_channel::{Receiver, Sender};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant, sleep, timeout};

use crate::client::Client;
use crate::constants::{
    MAX_BACKTRACE_FRAMES, POLL_ERROR_DELAY, POP_TIMEOUT_SECONDS, PROMOTER_TICK,
};
use crate::cron::{CronEntry, CronExpression, CronRegistry, next_run};
use crate::job::{JobDescriptor, now_secs};
use crate::registry::{HandlerRegistry, HandlerSpec};
use crate::settings::Settings;
use crate::store::QueueStore;

/// The dispatcher: one poller and a bounded worker pool per configured
/// queue, plus the scheduled-job and cron promoters. Durable state lives in
/// Redis; each poller hands popped descriptors to its queue's bounded
/// channel, and a semaphore of the same capacity gates execution.
pub struct Worker {
    settings: Settings,
    store: QueueStore,
    registry: Arc<HandlerRegistry>,
    cron: CronRegistry,
    queues: Vec<String>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    pub async fn new(settings: Settings, registry: HandlerRegistry) -> Result<Self> {
        let store = QueueStore::connect(&settings.redis_url).await?;
        let mut queues = settings.queues.clone();
        queues.sort();
        queues.dedup();
        if queues.is_empty() {
            return Err(anyhow!("worker must be configured with at least one queue"));
        }
        let cron = CronRegistry::new(store.connection());
        Ok(Self {
            settings,
            store,
            registry: Arc::new(registry),
            cron,
            queues,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn store(&self) -> QueueStore {
        self.store.clone()
    }

    pub fn cron_registry(&self) -> CronRegistry {
        self.cron.clone()
    }

    pub fn client(&self) -> Client {
        Client::new(self.store.clone(), self.registry.clone())
    }

    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(queues = ?self.queues, "worker started");
        let mut handles = Vec::new();
        let mut semaphores: HashMap<String, Arc<Semaphore>> = HashMap::new();

        for queue in &self.queues {
            let concurrency = self.settings.concurrency_for(queue);
            let (tx, rx) = async_channel::bounded(concurrency);
            let semaphore = Arc::new(Semaphore::new(concurrency));
            semaphores.insert(queue.clone(), semaphore.clone());

            let conn = self.store.dedicated_connection().await?;
            handles.push(tokio::spawn(poll_queue(
                self.shutdown.clone(),
                conn,
                queue.clone(),
                tx,
            )));

            for _ in 0..concurrency {
                let context = ExecutionContext {
                    store: self.store.clone(),
                    registry: self.registry.clone(),
                };
                handles.push(tokio::spawn(worker_loop(
                    rx.clone(),
                    semaphore.clone(),
                    queue.clone(),
                    context,
                )));
            }
        }

        handles.push(tokio::spawn(promote_scheduled_loop(
            self.shutdown.clone(),
            self.store.clone(),
            self.queues.clone(),
        )));
        handles.push(tokio::spawn(cron_loop(CronContext {
            shutdown: self.shutdown.clone(),
            cron: self.cron.clone(),
            registry: self.registry.clone(),
            semaphores,
        })));

        while !self.shutdown.load(Ordering::SeqCst) {
            sleep(Duration::from_millis(100)).await;
        }
        // Pollers observe the flag within one pop timeout and drop their
        // senders; workers drain the closed channel and exit.
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("worker stopped");
        Ok(())
    }
}

async fn poll_queue(
    shutdown: Arc<AtomicBool>,
    mut conn: redis::aio::MultiplexedConnection,
    queue: String,
    tx: Sender<JobDescriptor>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match QueueStore::pop(&mut conn, &queue, POP_TIMEOUT_SECONDS).await {
            Ok(Some(job)) => {
                // Blocks while the pool is saturated: the poller never runs
                // more than the channel capacity ahead of execution.
                if tx.send(job).await.is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(queue = %queue, "queue poll failed: {err:#}");
                sleep_with_shutdown(&shutdown, POLL_ERROR_DELAY).await;
            }
        }
    }
}

struct ExecutionContext {
    store: QueueStore,
    registry: Arc<HandlerRegistry>,
}

async fn worker_loop(
    rx: Receiver<JobDescriptor>,
    semaphore: Arc<Semaphore>,
    queue: String,
    mut context: ExecutionContext,
) {
    while let Ok(job) = rx.recv().await {
        let permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        execute_job(&job, &queue, &mut context).await;
        drop(permit);
    }
}

/// Runs one descriptor to completion. Handler failures and timeouts feed
/// the retry machine; nothing propagates to the caller.
async fn execute_job(job: &JobDescriptor, queue: &str, context: &mut ExecutionContext) {
    let Some((spec, mut handler)) = context.registry.resolve(&job.class) else {
        tracing::error!(class = %job.class, queue, "no handler registered; recording permanent failure");
        let error = format!("no handler registered for job class '{}'", job.class);
        if let Err(err) = context.store.store_failed(job, &error, Vec::new()).await {
            tracing::error!(class = %job.class, "failed to record unregistered job: {err:#}");
        }
        return;
    };

    let mut args = job.args.clone();
    if let Some(enqueued_at) = job.enqueued_at {
        args.push(Value::from(enqueued_at));
    }

    let attempt = job.retry_count + 1;
    tracing::debug!(class = %job.class, queue, attempt, "job started");
    if let Err(err) = context.store.incr_processing(queue).await {
        tracing::debug!(queue, "failed to bump processing counter: {err:#}");
    }
    let started = Instant::now();
    let outcome = match timeout(spec.timeout, handler.perform(args)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!(
            "job timed out after {:.1}s",
            spec.timeout.as_secs_f64()
        )),
    };
    if let Err(err) = context.store.decr_processing(queue).await {
        tracing::debug!(queue, "failed to drop processing counter: {err:#}");
    }

    match outcome {
        Ok(()) => {
            tracing::info!(
                class = %job.class,
                queue,
                attempt,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "job completed"
            );
        }
        Err(err) => retry_or_fail(job, &spec, &err, &mut context.store).await,
    }
}

async fn retry_or_fail(
    job: &JobDescriptor,
    spec: &HandlerSpec,
    err: &anyhow::Error,
    store: &mut QueueStore,
) {
    if job.retry_count < spec.max_retries {
        let attempt = job.retry_count + 1;
        let delay = (spec.retry_delay)(attempt).max(0.0);
        let mut retry = job.next_retry();
        if spec.priority_retry {
            retry.priority_retry = Some(true);
        }
        tracing::warn!(
            class = %job.class,
            attempt,
            max_retries = spec.max_retries,
            delay,
            "job failed, retrying: {err:#}"
        );
        if let Err(store_err) = store.schedule(&spec.queue, &retry, now_secs() + delay).await {
            tracing::error!(class = %job.class, "failed to schedule retry: {store_err:#}");
        }
    } else {
        tracing::warn!(
            class = %job.class,
            retries = job.retry_count,
            "job failed permanently: {err:#}"
        );
        if let Err(store_err) = store
            .store_failed(job, &err.to_string(), error_frames(err))
            .await
        {
            tracing::error!(class = %job.class, "failed to record failed job: {store_err:#}");
        }
    }
}

fn error_frames(err: &anyhow::Error) -> Vec<String> {
    err.chain()
        .skip(1)
        .take(MAX_BACKTRACE_FRAMES)
        .map(|cause| cause.to_string())
        .collect()
}

async fn promote_scheduled_loop(
    shutdown: Arc<AtomicBool>,
    mut store: QueueStore,
    queues: Vec<String>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let now = now_secs();
        for queue in &queues {
            match store.promote_due(queue, now).await {
                Ok(0) => {}
                Ok(promoted) => {
                    tracing::debug!(queue = %queue, promoted, "promoted scheduled jobs");
                }
                Err(err) => {
                    tracing::error!(queue = %queue, "scheduled promotion failed: {err:#}");
                }
            }
        }
        sleep_with_shutdown(&shutdown, PROMOTER_TICK).await;
    }
}

struct CronContext {
    shutdown: Arc<AtomicBool>,
    cron: CronRegistry,
    registry: Arc<HandlerRegistry>,
    semaphores: HashMap<String, Arc<Semaphore>>,
}

async fn cron_loop(mut context: CronContext) {
    let mut executions = tokio::task::JoinSet::new();
    while !context.shutdown.load(Ordering::SeqCst) {
        while executions.try_join_next().is_some() {}
        match context.cron.due_jobs(now_secs()).await {
            Ok(entries) => {
                for entry in entries {
                    let Some(semaphore) = context.semaphores.get(&entry.queue) else {
                        tracing::warn!(
                            class = %entry.class,
                            queue = %entry.queue,
                            "cron entry targets an unpolled queue; skipping"
                        );
                        continue;
                    };
                    // Cron work takes the same admission permits as queued
                    // work on the target queue.
                    let Ok(permit) = semaphore.clone().acquire_owned().await else {
                        break;
                    };
                    let registry = context.registry.clone();
                    let cron = context.cron.clone();
                    executions.spawn(async move {
                        let _permit = permit;
                        execute_cron(entry, registry, cron).await;
                    });
                }
            }
            Err(err) => tracing::error!("cron poll failed: {err:#}"),
        }
        sleep_with_shutdown(&context.shutdown, PROMOTER_TICK).await;
    }
    // In-flight cron runs finish before shutdown completes.
    while executions.join_next().await.is_some() {}
}

/// Fires one cron entry. Failures are logged, never retried through the
/// retry machine; the next scheduled fire is the retry.
async fn execute_cron(entry: CronEntry, registry: Arc<HandlerRegistry>, mut cron: CronRegistry) {
    let fired_at = Utc::now();
    let result = match registry.resolve(&entry.class) {
        Some((spec, mut handler)) => match timeout(spec.timeout, handler.perform(Vec::new())).await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "cron job timed out after {:.1}s",
                spec.timeout.as_secs_f64()
            )),
        },
        None => Err(anyhow!(
            "no handler registered for cron class '{}'",
            entry.class
        )),
    };
    match result {
        Ok(()) => tracing::info!(class = %entry.class, "cron job completed"),
        Err(err) => tracing::warn!(class = %entry.class, "cron job failed: {err:#}"),
    }

    match entry
        .cron
        .parse::<CronExpression>()
        .map(|expr| next_run(&expr, fired_at))
    {
        Ok(Ok(next)) => {
            if let Err(err) = cron
                .schedule_job(&entry.class, next.timestamp() as f64)
                .await
            {
                tracing::error!(class = %entry.class, "failed to re-schedule cron job: {err:#}");
            }
        }
        Ok(Err(err)) | Err(err) => {
            tracing::error!(class = %entry.class, "failed to compute next cron run: {err:#}");
        }
    }
}

async fn sleep_with_shutdown(shutdown: &Arc<AtomicBool>, duration: Duration) {
    let mut remaining = duration;
    let step = Duration::from_millis(100);
    while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
        let next = remaining.min(step);
        sleep(next).await;
        remaining = remaining.saturating_sub(next);
    }
}
