use anyhow::Result;

use redq::settings::Settings;
use redq::store::QueueStore;

pub async fn print_stats(settings: Settings, queues: Vec<String>) -> Result<()> {
    let mut store = QueueStore::connect(&settings.redis_url).await?;
    let queues = if queues.is_empty() {
        settings.queues.clone()
    } else {
        queues
    };
    println!(
        "{:<24} {:>8} {:>10} {:>11}",
        "queue", "size", "scheduled", "processing"
    );
    for queue in &queues {
        let stats = store.stats(queue).await?;
        println!(
            "{:<24} {:>8} {:>10} {:>11}",
            queue, stats.size, stats.scheduled, stats.processing
        );
    }
    Ok(())
}

pub async fn print_failed(settings: Settings) -> Result<()> {
    let mut store = QueueStore::connect(&settings.redis_url).await?;
    let failed = store.failed_jobs().await?;
    if failed.is_empty() {
        println!("no failed jobs");
        return Ok(());
    }
    for record in failed {
        println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Ok(())
}
