//! ipfs-crawler main entry point
//!
//! This is the command-line interface for the queue-driven IPFS crawler.

use clap::Parser;
use ipfs_crawler::config::{load_config_with_hash, Config};
use ipfs_crawler::crawler::{run_workers, seed, Services};
use ipfs_crawler::index::SqliteIndex;
use ipfs_crawler::transport::{AmqpBroker, Broker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// ipfs-crawler: crawls IPFS hashes into a search index
///
/// Workers pull hashes from the broker, expand directories, extract file
/// metadata and write index records. Run several processes against the same
/// broker to spread the work.
#[derive(Parser, Debug)]
#[command(name = "ipfs-crawler")]
#[command(version = "1.0.0")]
#[command(about = "A queue-driven IPFS crawler", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show the effective settings without crawling
    #[arg(long, conflicts_with_all = ["stats", "seed"])]
    dry_run: bool,

    /// Show index statistics and exit
    #[arg(long, conflicts_with_all = ["dry_run", "seed"])]
    stats: bool,

    /// Queue root hashes for crawling and exit
    #[arg(long, value_name = "HASH", num_args = 1.., conflicts_with_all = ["dry_run", "stats"])]
    seed: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            cfg
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle different modes
    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else if !cli.seed.is_empty() {
        handle_seed(&config, &cli.seed).await?;
    } else {
        handle_crawl(config).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("ipfs_crawler=info,warn"),
            1 => EnvFilter::new("ipfs_crawler=debug,info"),
            2 => EnvFilter::new("ipfs_crawler=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: shows the effective settings
fn handle_dry_run(config: &Config) {
    println!("=== ipfs-crawler Dry Run ===\n");

    println!("Crawler:");
    println!("  Partial size: {} bytes", config.crawler.partial_size);
    println!(
        "  Metadata max size: {} bytes",
        config.crawler.metadata_max_size
    );
    println!("  Retry wait: {}ms", config.crawler.retry_wait);
    println!("  File workers: {}", config.crawler.file_workers);
    println!("  Directory workers: {}", config.crawler.directory_workers);

    println!("\nExtractor:");
    println!("  URL: {}", config.extractor.url);
    println!("  Timeout: {}ms", config.extractor.timeout);

    println!("\nIPFS:");
    println!("  API: {}", config.ipfs.api_url);
    println!("  Timeout: {}ms", config.ipfs.timeout);

    println!("\nBroker:");
    println!("  URL: {}", AmqpBroker::new(&config.amqp.url).describe());
    println!("  Reconnect wait: {}ms", config.amqp.reconnect_wait);
    println!("  Max reconnect attempts: {}", config.amqp.max_reconnect);
    println!("  File queue: {}", config.amqp.file_queue);
    println!("  Directory queue: {}", config.amqp.directory_queue);

    println!("\nIndex:");
    println!("  Database: {}", config.index.database_path);

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows record counts per type
fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Database: {}\n", config.index.database_path);

    let index = SqliteIndex::new(Path::new(&config.index.database_path))?;

    println!("Indexed items: {}", index.count_total()?);
    for (item_type, count) in index.count_by_type()? {
        println!("  {:<12} {}", item_type, count);
    }

    Ok(())
}

/// Handles the --seed mode: queues root hashes
async fn handle_seed(config: &Config, hashes: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let broker = Arc::new(AmqpBroker::new(&config.amqp.url));

    match seed(broker, &config.amqp, hashes).await {
        Ok(count) => {
            println!("✓ Queued {} hashes on {}", count, config.amqp.directory_queue);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Seeding failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handles the main worker run
async fn handle_crawl(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let services = Services::from_config(&config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, stopping workers");
            on_signal.cancel();
        }
    });

    match run_workers(&config, services, &cancel).await {
        Ok(()) => {
            tracing::info!("Crawler stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawler failed: {}", e);
            Err(e.into())
        }
    }
}
