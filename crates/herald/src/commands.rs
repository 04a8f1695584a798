//! One-shot queue and inspection commands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_queue::{DelayedQueue, EnqueueOptions, Job, JobState, LocalStore};
use herald_resilience::{BackoffConfig, FailureClassifier, PlatformTable, ProviderError};
use miette::Result;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StrategyArg {
    Exponential,
    Linear,
    Constant,
}

/// When a job should become due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum When {
    Now,
    At(DateTime<Utc>),
    After(Duration),
}

impl When {
    pub fn from_args(at: Option<&str>, delay: Option<u64>) -> Result<Self> {
        match (at, delay) {
            (Some(at), _) => {
                let at = DateTime::parse_from_rfc3339(at)
                    .map_err(|e| miette::miette!("invalid time '{}': {}", at, e))?;
                Ok(When::At(at.with_timezone(&Utc)))
            }
            (None, Some(secs)) => Ok(When::After(Duration::from_secs(secs))),
            (None, None) => Ok(When::Now),
        }
    }

    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            When::Now => now,
            When::At(at) => at,
            When::After(delay) => chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

/// A `field=value` match against job payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFilter {
    field: String,
    value: String,
}

impl PayloadFilter {
    pub fn parse(s: &str) -> Result<Self> {
        let (field, value) = s
            .split_once('=')
            .ok_or_else(|| miette::miette!("filter '{}' is not of the form field=value", s))?;
        let field = field.trim();
        if field.is_empty() {
            return Err(miette::miette!("filter '{}' has an empty field", s));
        }
        Ok(Self {
            field: field.to_string(),
            value: value.trim().to_string(),
        })
    }

    /// Strings compare by content, everything else by its JSON text.
    pub fn matches(&self, payload: &Value) -> bool {
        let found = if self.field.starts_with('/') {
            payload.pointer(&self.field)
        } else {
            payload.get(&self.field)
        };
        match found {
            Some(Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

pub fn options(
    priority: i32,
    max_attempts: Option<u32>,
    platform: Option<String>,
    resource: Option<String>,
) -> EnqueueOptions {
    let mut options = EnqueueOptions::default().priority(priority);
    if let Some(max_attempts) = max_attempts {
        options = options.max_attempts(max_attempts);
    }
    if let Some(platform) = platform {
        options = options.platform(platform);
    }
    if let Some(resource) = resource {
        options = options.resource_key(resource);
    }
    options
}

pub fn backoff_config(
    strategy: StrategyArg,
    base_ms: u64,
    factor: f64,
    increment_ms: u64,
    max_ms: u64,
    jitter: f64,
) -> BackoffConfig {
    let base = Duration::from_millis(base_ms);
    let max = Duration::from_millis(max_ms);
    let config = match strategy {
        StrategyArg::Exponential => BackoffConfig::exponential(base, factor, max),
        StrategyArg::Linear => {
            BackoffConfig::linear(base, Duration::from_millis(increment_ms), max)
        }
        StrategyArg::Constant => BackoffConfig::constant(base),
    };
    config.with_jitter(jitter)
}

pub async fn open_queue(path: &Path) -> Result<DelayedQueue> {
    let store = LocalStore::open(path)
        .await
        .map_err(|e| miette::miette!("failed to open queue {}: {}", path.display(), e))?;
    Ok(DelayedQueue::new(Arc::new(store)))
}

/// Register the platform tables in a JSON file.
pub async fn load_tables(classifier: &FailureClassifier, path: &Path) -> Result<()> {
    let json = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
    let tables = PlatformTable::list_from_json(&json)
        .map_err(|e| miette::miette!("invalid platform tables in {}: {}", path.display(), e))?;
    for table in tables {
        info!(platform = %table.platform, rules = table.rules.len(), "registered platform table");
        classifier.register(table);
    }
    Ok(())
}

pub async fn enqueue(
    store: &Path,
    key: &str,
    payload: &str,
    when: When,
    options: EnqueueOptions,
) -> Result<()> {
    let payload: Value =
        serde_json::from_str(payload).map_err(|e| miette::miette!("invalid payload: {}", e))?;
    let queue = open_queue(store).await?;
    let not_before = when.resolve(queue.now());

    let id = queue
        .enqueue_delayed(key, payload, not_before, options)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    println!("{}", id);
    Ok(())
}

pub async fn reschedule(store: &Path, key: &str, when: When) -> Result<()> {
    let queue = open_queue(store).await?;
    let not_before = when.resolve(queue.now());
    let moved = queue
        .reschedule(key, not_before)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    if !moved {
        return Err(miette::miette!("no pending job for {}", key));
    }

    if let Some(job) = queue.get(key).await.map_err(|e| miette::miette!("{}", e))? {
        println!("{} {}", job.id, job.not_before.to_rfc3339());
    }
    Ok(())
}

pub async fn cancel(store: &Path, key: &str) -> Result<()> {
    let queue = open_queue(store).await?;
    if queue.cancel(key).await.map_err(|e| miette::miette!("{}", e))? {
        println!("cancelled {}", key);
        return Ok(());
    }

    match queue.get(key).await.map_err(|e| miette::miette!("{}", e))? {
        Some(job) if job.state == JobState::Active => {
            println!("cancellation requested for running job {}", key);
            Ok(())
        }
        _ => Err(miette::miette!("no cancellable job for {}", key)),
    }
}

pub async fn list(store: &Path, due: bool, all: bool, filters: &[String]) -> Result<()> {
    let filters = filters
        .iter()
        .map(|f| PayloadFilter::parse(f))
        .collect::<Result<Vec<_>>>()?;
    let queue = open_queue(store).await?;

    let jobs = if due {
        queue.list_due(queue.now()).await
    } else if all {
        queue.list_all().await
    } else {
        queue.list_scheduled().await
    }
    .map_err(|e| miette::miette!("{}", e))?;

    for job in select(jobs, &filters) {
        let line = serde_json::to_string(&job).map_err(|e| miette::miette!("{}", e))?;
        println!("{}", line);
    }
    Ok(())
}

fn select(jobs: Vec<Job>, filters: &[PayloadFilter]) -> Vec<Job> {
    jobs.into_iter()
        .filter(|job| filters.iter().all(|f| f.matches(&job.payload)))
        .collect()
}

pub async fn show(store: &Path, key: &str) -> Result<()> {
    let queue = open_queue(store).await?;
    let job = queue
        .get(key)
        .await
        .map_err(|e| miette::miette!("{}", e))?
        .ok_or_else(|| miette::miette!("no job for {}", key))?;
    let json = serde_json::to_string_pretty(&job).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", json);
    Ok(())
}

pub async fn classify(
    platform: &str,
    code: &str,
    message: &str,
    tables: Option<&Path>,
) -> Result<()> {
    let classifier = FailureClassifier::with_builtin_tables();
    if let Some(path) = tables {
        load_tables(&classifier, path).await?;
    }

    let error = ProviderError::for_platform(platform, code, message);
    let classification = classifier.classify(platform, &error);
    let json =
        serde_json::to_string_pretty(&classification).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", json);
    Ok(())
}

pub fn backoff(config: BackoffConfig, attempts: u32) -> Result<()> {
    for (attempt, delay) in schedule(&config, attempts)? {
        println!("{}\t{}ms", attempt, delay.as_millis());
    }
    Ok(())
}

fn schedule(config: &BackoffConfig, attempts: u32) -> Result<Vec<(u32, Duration)>> {
    config.validate().map_err(|e| miette::miette!("{}", e))?;
    (1..=attempts)
        .map(|attempt| {
            config
                .delay(attempt)
                .map(|delay| (attempt, delay))
                .map_err(|e| miette::miette!("{}", e))
        })
        .collect()
}
