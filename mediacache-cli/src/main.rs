use clap::Parser;
use mediacache_engine::MediaCache;
use tracing::{Level, debug, error};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod config;
mod error;
mod processor;
mod utils;

use cli::CliArgs;
use error::AppError;
use utils::progress::ProgressManager;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    // Parse command-line arguments
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(args.verbose)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    let config = config::build_cache_config(&args)?;
    debug!(
        memory_entries = config.memory_count_limit,
        memory_bytes = config.memory_cost_limit,
        compress = config.compress_memory,
        "Opening cache"
    );
    let cache = MediaCache::new(config).await?;

    let progress = if args.no_progress {
        ProgressManager::new_disabled()
    } else {
        ProgressManager::new()
    };

    processor::process(&cache, args.command, &progress).await
}
