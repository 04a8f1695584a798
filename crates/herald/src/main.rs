//! Herald: delayed publish queue
//!
//! Main binary with subcommands:
//! - `enqueue`, `reschedule`, `cancel`: mutate the queue file
//! - `list`, `show`: inspect queued jobs
//! - `classify`, `backoff`: inspect failure handling
//! - `run`: dispatch due jobs to a webhook until interrupted

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod webhook;
mod worker;

use commands::StrategyArg;

#[derive(Parser)]
#[command(name = "herald")]
#[command(about = "Delayed publish queue with retries and circuit breaking", long_about = None)]
struct Cli {
    /// Queue file
    #[arg(long, global = true, env = "HERALD_STORE", default_value = "herald-queue.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Schedule a job, replacing any pending job with the same key
    Enqueue {
        /// Idempotency key
        key: String,

        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Earliest run time (RFC 3339)
        #[arg(long, conflicts_with = "delay")]
        at: Option<String>,

        /// Seconds from now until the job is due
        #[arg(long)]
        delay: Option<u64>,

        /// Higher runs first among due jobs
        #[arg(long, default_value = "0")]
        priority: i32,

        #[arg(long)]
        max_attempts: Option<u32>,

        /// Platform used to classify failures
        #[arg(long)]
        platform: Option<String>,

        /// Circuit breaker and rate limit key
        #[arg(long)]
        resource: Option<String>,
    },

    /// Move a pending job to a new time
    Reschedule {
        key: String,

        /// New run time (RFC 3339)
        #[arg(long, conflicts_with = "delay", required_unless_present = "delay")]
        at: Option<String>,

        /// Seconds from now
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Cancel a job
    Cancel { key: String },

    /// List scheduled jobs
    List {
        /// Only jobs due now
        #[arg(long)]
        due: bool,

        /// Include finished jobs
        #[arg(long, conflicts_with = "due")]
        all: bool,

        /// Payload filter as `field=value` (repeatable). A field starting
        /// with `/` is a JSON pointer.
        #[arg(long = "where", value_name = "FIELD=VALUE")]
        filters: Vec<String>,
    },

    /// Show one job
    Show { key: String },

    /// Classify a provider error
    Classify {
        #[arg(long)]
        platform: String,

        #[arg(long)]
        code: String,

        #[arg(long, default_value = "")]
        message: String,

        /// Extra platform tables (JSON array)
        #[arg(long, env = "HERALD_TABLES")]
        tables: Option<PathBuf>,
    },

    /// Print a backoff schedule
    Backoff {
        #[arg(long, value_enum, default_value = "exponential")]
        strategy: StrategyArg,

        #[arg(long, default_value = "1000")]
        base_ms: u64,

        #[arg(long, default_value = "2.0")]
        factor: f64,

        #[arg(long, default_value = "1000")]
        increment_ms: u64,

        #[arg(long, default_value = "300000")]
        max_ms: u64,

        /// Jitter fraction in [0, 1]
        #[arg(long, default_value = "0.0")]
        jitter: f64,

        #[arg(long, default_value = "5")]
        attempts: u32,
    },

    /// Dispatch due jobs to a webhook until interrupted
    Run {
        /// Publish endpoint
        #[arg(long, env = "HERALD_WEBHOOK_URL")]
        webhook_url: String,

        /// Maximum concurrent deliveries
        #[arg(long, env = "HERALD_CONCURRENCY", default_value = "4")]
        concurrency: usize,

        /// Deliveries allowed per resource per window (0 disables)
        #[arg(long, env = "HERALD_RATE_LIMIT", default_value = "60")]
        rate_limit: u32,

        /// Rate limit window in seconds
        #[arg(long, default_value = "60")]
        rate_window: u64,

        /// Idle poll interval in seconds
        #[arg(long, env = "HERALD_POLL_INTERVAL", default_value = "1")]
        poll_interval: u64,

        /// Job lease in seconds
        #[arg(long, env = "HERALD_LEASE_SECS", default_value = "300")]
        lease_secs: u64,

        /// Per-attempt timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,

        /// Consecutive failures that open a resource's circuit
        #[arg(long, default_value = "5")]
        breaker_threshold: u32,

        /// Seconds an open circuit waits before a trial delivery
        #[arg(long, default_value = "30")]
        breaker_reset_secs: u64,

        #[arg(long, env = "HERALD_WORKER_ID")]
        worker_id: Option<String>,

        /// Extra platform tables (JSON array)
        #[arg(long, env = "HERALD_TABLES")]
        tables: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "herald=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let store = cli.store;

    match cli.command {
        Commands::Enqueue {
            key,
            payload,
            at,
            delay,
            priority,
            max_attempts,
            platform,
            resource,
        } => {
            commands::enqueue(
                &store,
                &key,
                &payload,
                commands::When::from_args(at.as_deref(), delay)?,
                commands::options(priority, max_attempts, platform, resource),
            )
            .await
        }

        Commands::Reschedule { key, at, delay } => {
            commands::reschedule(&store, &key, commands::When::from_args(at.as_deref(), delay)?)
                .await
        }

        Commands::Cancel { key } => commands::cancel(&store, &key).await,

        Commands::List { due, all, filters } => {
            commands::list(&store, due, all, &filters).await
        }

        Commands::Show { key } => commands::show(&store, &key).await,

        Commands::Classify {
            platform,
            code,
            message,
            tables,
        } => commands::classify(&platform, &code, &message, tables.as_deref()).await,

        Commands::Backoff {
            strategy,
            base_ms,
            factor,
            increment_ms,
            max_ms,
            jitter,
            attempts,
        } => commands::backoff(
            commands::backoff_config(strategy, base_ms, factor, increment_ms, max_ms, jitter),
            attempts,
        ),

        Commands::Run {
            webhook_url,
            concurrency,
            rate_limit,
            rate_window,
            poll_interval,
            lease_secs,
            timeout_secs,
            breaker_threshold,
            breaker_reset_secs,
            worker_id,
            tables,
        } => {
            worker::run(worker::WorkerConfig {
                store,
                webhook_url,
                concurrency,
                rate_limit,
                rate_window,
                poll_interval,
                lease_secs,
                timeout_secs,
                breaker_threshold,
                breaker_reset_secs,
                worker_id,
                tables,
            })
            .await
        }
    }
}
