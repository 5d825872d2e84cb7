use std::sync::atomic::Ordering;

use anyhow::Result;

use redq::registry::HandlerRegistry;
use redq::settings::Settings;
use redq::worker::Worker;

/// The operator binary runs with an empty registry; embedding applications
/// build their own binary around [`Worker`] and register job classes
/// before starting it.
pub async fn run_worker(mut settings: Settings, queues: Vec<String>) -> Result<()> {
    if !queues.is_empty() {
        settings.queues = queues;
    }
    let registry = HandlerRegistry::new();
    tracing::warn!("no job classes registered; popped descriptors will fail permanently");
    let mut worker = Worker::new(settings, registry).await?;
    let shutdown = worker.shutdown_handle();
    let mut handle = tokio::spawn(async move { worker.run().await });

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received, draining");
            shutdown.store(true, Ordering::SeqCst);
        }
        result = &mut handle => {
            result??;
            return Ok(());
        }
    }
    handle.await??;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let sigint = signal(SignalKind::interrupt());
        let sigterm = signal(SignalKind::terminate());
        match (sigint, sigterm) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
