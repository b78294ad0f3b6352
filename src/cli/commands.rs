//! CLI command definitions for mailqueue.
//!
//! Runs the delivery queue against Redis and exposes the admin operations
//! (stats, retry and clear of failed mail, persistence check) as
//! subcommands.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::queue::MailQueue;
use crate::store::{RedisStore, Store};

/// Default Redis URL when neither the flag nor the environment sets one.
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default number of dead-letter entries shown by `peek-failed`.
const DEFAULT_PEEK_LIMIT: usize = 10;

/// Persistent, self-scaling email delivery queue.
#[derive(Parser)]
#[command(name = "mailqueue")]
#[command(about = "Run and administer a Redis-backed email delivery queue")]
#[command(version)]
#[command(
    long_about = "mailqueue delivers email through a Redis-backed queue with deduplication, \
                  delayed retries, a dead-letter list and a worker pool that scales with load.\n\n\
                  Example usage:\n  mailqueue --redis-url redis://localhost:6379 run\n  \
                  mailqueue stats --json\n  mailqueue retry-failed"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Redis connection URL.
    #[arg(long, env = "MAILQUEUE_REDIS_URL", default_value = DEFAULT_REDIS_URL, global = true)]
    pub redis_url: String,

    /// YAML configuration file; durations in whole seconds.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Baseline worker count the pool bounds and thresholds derive from.
    #[arg(short, long, global = true, conflicts_with = "config")]
    pub workers: Option<usize>,

    /// Key prefix for every store key.
    #[arg(long, global = true)]
    pub prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run workers, the retry dispatcher and the scaling monitor until Ctrl-C.
    Run(RunArgs),

    /// Submit one message to the queue.
    Submit(SubmitArgs),

    /// Show queue statistics.
    Stats(StatsArgs),

    /// Re-submit every dead-lettered message with its retry count reset.
    RetryFailed,

    /// Delete every dead-lettered message.
    ClearFailed,

    /// Show the newest dead-lettered messages without removing them.
    PeekFailed(PeekFailedArgs),

    /// Report the Redis persistence configuration.
    CheckPersistence,
}

/// Arguments for `mailqueue run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Print the Prometheus metrics export on exit.
    #[arg(long)]
    pub dump_metrics: bool,
}

/// Arguments for `mailqueue submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Recipient address; several may be joined with `;`.
    #[arg(long)]
    pub to: String,

    /// Message subject.
    #[arg(short, long)]
    pub subject: String,

    /// Message body.
    #[arg(short, long)]
    pub body: String,
}

/// Arguments for `mailqueue stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `mailqueue peek-failed`.
#[derive(Parser, Debug)]
pub struct PeekFailedArgs {
    /// Maximum number of entries to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_PEEK_LIMIT)]
    pub limit: usize,
}

impl Cli {
    /// Filter directive for `--log-level`.
    ///
    /// The level applies to this crate; dependencies such as `redis` stay at
    /// `warn` so `--log-level debug` does not flood the output.
    pub fn log_directive(&self) -> String {
        format!("warn,mailqueue={}", self.log_level)
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run(args) => run_queue(&cli.redis_url, config, args).await,
        Commands::Submit(args) => run_submit(&cli.redis_url, config, args).await,
        Commands::Stats(args) => run_stats(&cli.redis_url, config, args).await,
        Commands::RetryFailed => {
            let queue = connect_queue(&cli.redis_url, config).await?;
            let moved = queue.retry_failed_all().await?;
            println!("Re-submitted {} failed message(s)", moved);
            Ok(())
        }
        Commands::ClearFailed => {
            let queue = connect_queue(&cli.redis_url, config).await?;
            let cleared = queue.clear_failed_all().await?;
            println!("Cleared {} failed message(s)", cleared);
            Ok(())
        }
        Commands::PeekFailed(args) => {
            let queue = connect_queue(&cli.redis_url, config).await?;
            let entries = queue.peek_failed(args.limit).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
        Commands::CheckPersistence => {
            let store = RedisStore::connect(&cli.redis_url)
                .await
                .with_context(|| format!("Failed to connect to {}", cli.redis_url))?;
            let report = store.persistence_report().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Builds the queue configuration from the global options.
fn load_config(cli: &Cli) -> anyhow::Result<QueueConfig> {
    let mut config = match (&cli.config, cli.workers) {
        (Some(path), _) => QueueConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        (None, Some(workers)) => QueueConfig::from_baseline(workers),
        (None, None) => QueueConfig::default(),
    };

    if let Some(prefix) = &cli.prefix {
        config = config.with_key_prefix(prefix.clone());
    }
    config.validate()?;

    Ok(config)
}

async fn connect_queue(redis_url: &str, config: QueueConfig) -> anyhow::Result<MailQueue> {
    let store = RedisStore::connect(redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", redis_url))?;
    Ok(MailQueue::new(config, Some(Arc::new(store))))
}

async fn run_queue(redis_url: &str, config: QueueConfig, args: RunArgs) -> anyhow::Result<()> {
    init_metrics()?;

    let store = RedisStore::connect(redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", redis_url))?;
    if let Err(e) = store.persistence_report().await {
        warn!(error = %e, "Could not inspect Redis persistence");
    }

    let queue = MailQueue::new(config, Some(Arc::new(store) as Arc<dyn Store>));
    queue.start().await;

    info!("Mail queue running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    if let Err(e) = queue.shutdown().await {
        warn!(error = %e, "Shutdown did not complete cleanly");
    }

    if args.dump_metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

async fn run_submit(redis_url: &str, config: QueueConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let queue = match RedisStore::connect(redis_url).await {
        Ok(store) => MailQueue::new(config, Some(Arc::new(store))),
        Err(e) => {
            warn!(error = %e, "Redis unreachable, message will be sent synchronously");
            MailQueue::new(config, None)
        }
    };

    let outcome = queue.submit(&args.to, &args.subject, &args.body).await?;
    println!("{:?}", outcome);
    Ok(())
}

async fn run_stats(redis_url: &str, config: QueueConfig, args: StatsArgs) -> anyhow::Result<()> {
    let queue = connect_queue(redis_url, config).await?;
    let stats = queue.stats().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("\n=== Mail Queue ===");
        println!("Status:          {}", stats.status);
        println!(
            "Workers:         {} (min {}, max {})",
            stats.worker_count, stats.min_workers, stats.max_workers
        );
        println!("Ready:           {}", stats.queue_size);
        println!("Delayed:         {}", stats.delayed_size);
        println!("Failed:          {}", stats.failed_size);
        println!("Processed total: {}", stats.processed_total);
        println!("Failed total:    {}", stats.failed_total);
    }

    Ok(())
}
