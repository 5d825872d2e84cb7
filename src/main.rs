use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{print_failed, print_stats, run_worker};
use redq::config::load_settings;

#[derive(Parser)]
#[command(name = "redq")]
#[command(about = "Redis-backed background job worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker dispatcher with the current configuration.
    Worker {
        #[arg(long)]
        config: Option<String>,
        #[arg(long, action = clap::ArgAction::Append)]
        queue: Vec<String>,
    },
    /// Print a stats snapshot per queue.
    Stats {
        #[arg(long)]
        config: Option<String>,
        #[arg(long, action = clap::ArgAction::Append)]
        queue: Vec<String>,
    },
    /// List failed-job records.
    Failed {
        #[arg(long)]
        config: Option<String>,
    },
    /// Print the version.
    Version,
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Worker { config, queue } => {
            let settings = load_settings(config.as_deref())?;
            init_tracing(&settings.log_level);
            run_worker(settings, queue).await?;
        }
        Commands::Stats { config, queue } => {
            let settings = load_settings(config.as_deref())?;
            init_tracing(&settings.log_level);
            print_stats(settings, queue).await?;
        }
        Commands::Failed { config } => {
            let settings = load_settings(config.as_deref())?;
            init_tracing(&settings.log_level);
            print_failed(settings).await?;
        }
        Commands::Version => {
            println!("redq {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
