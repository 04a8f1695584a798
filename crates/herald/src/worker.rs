//! Long-running dispatch loop.
//!
//! The worker shares the queue file with one-shot commands and with other
//! workers; the store locks and reloads it around every operation. A
//! `herald cancel` against a running job reaches the worker on its next
//! lease renewal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use herald_queue::{DispatchEvent, Dispatcher, DispatcherConfig};
use herald_resilience::{CircuitBreakerConfig, FailureClassifier, RateLimitConfig};
use miette::Result;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{error, info, warn};

use crate::commands;
use crate::webhook::WebhookPublisher;

/// Floor for the lease renewal interval.
const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(1);

/// Settings for `herald run`.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store: PathBuf,
    pub webhook_url: String,
    pub concurrency: usize,
    /// Deliveries per resource per window; 0 disables limiting.
    pub rate_limit: u32,
    pub rate_window: u64,
    pub poll_interval: u64,
    pub lease_secs: u64,
    pub timeout_secs: u64,
    pub breaker_threshold: u32,
    pub breaker_reset_secs: u64,
    pub worker_id: Option<String>,
    pub tables: Option<PathBuf>,
}

impl WorkerConfig {
    fn dispatcher_config(&self) -> DispatcherConfig {
        let lease = Duration::from_secs(self.lease_secs.max(1));
        let rate_limit = if self.rate_limit == 0 {
            RateLimitConfig::unlimited()
        } else {
            RateLimitConfig::new(self.rate_limit, Duration::from_secs(self.rate_window.max(1)))
        };

        let mut config = DispatcherConfig {
            concurrency: self.concurrency.max(1),
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
            lease_duration: lease,
            lease_renew_interval: (lease / 5).max(MIN_RENEW_INTERVAL).min(lease / 2),
            attempt_timeout: Some(Duration::from_secs(self.timeout_secs.max(1))),
            rate_limit,
            circuit_breaker: CircuitBreakerConfig {
                threshold: self.breaker_threshold.max(1),
                reset_timeout: Duration::from_secs(self.breaker_reset_secs),
                ..CircuitBreakerConfig::default()
            },
            ..DispatcherConfig::default()
        };
        if let Some(worker_id) = &self.worker_id {
            config.worker_id = worker_id.clone();
        }
        config
    }
}

/// Wire the queue file, classifier and webhook into a dispatcher.
pub async fn build(config: &WorkerConfig) -> Result<Arc<Dispatcher>> {
    let queue = commands::open_queue(&config.store).await?;

    let classifier = FailureClassifier::with_builtin_tables();
    if let Some(path) = &config.tables {
        commands::load_tables(&classifier, path).await?;
    }

    let dispatcher_config = config.dispatcher_config();
    dispatcher_config
        .validate()
        .map_err(|e| miette::miette!("{}", e))?;
    let timeout = dispatcher_config
        .attempt_timeout
        .unwrap_or(Duration::from_secs(30));
    let publisher = WebhookPublisher::new(&config.webhook_url, timeout)
        .map_err(|e| miette::miette!("failed to build HTTP client: {}", e))?;

    let dispatcher = Dispatcher::new(Arc::new(queue), publisher.handler(), dispatcher_config)
        .with_classifier(Arc::new(classifier));
    Ok(Arc::new(dispatcher))
}

/// Run until Ctrl-C, then let in-flight deliveries settle.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let dispatcher = build(&config).await?;
    info!(
        store = %config.store.display(),
        webhook = %config.webhook_url,
        worker_id = %dispatcher.config().worker_id,
        concurrency = dispatcher.config().concurrency,
        "starting dispatcher"
    );

    let events = log_events(&dispatcher);
    dispatcher.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for shutdown signal: {}", e))?;
    info!("received shutdown signal, releasing waiting jobs and finishing in-flight deliveries");

    dispatcher.close().await;
    events.abort();
    info!("dispatcher stopped");
    Ok(())
}

/// Print lifecycle events to stdout as JSON lines.
fn log_events(dispatcher: &Dispatcher) -> JoinHandle<()> {
    let mut stream = BroadcastStream::new(dispatcher.subscribe());
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    if let DispatchEvent::Failed { key, error, .. } = &event {
                        warn!(key, error, "job failed");
                    }
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => error!(error = %e, "failed to encode event"),
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log lagged");
                }
            }
        }
    })
}
