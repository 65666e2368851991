//! Background fetch loop plus the consumer-facing snapshot API.

pub mod scheduler;

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::aggregated::{AggregateMetric, MetricsBuffer};
use crate::config::WorkerConfig;
use crate::export::health::HealthMetrics;
use crate::fetcher::Fetcher;

pub use scheduler::{Scheduler, SchedulerError, Tick};

/// Result of draining a worker's buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// Aggregates accumulated by background ticks since the last snapshot.
    Buffered(Vec<AggregateMetric>),
    /// The buffer was empty; aggregates come from a one-shot direct fetch.
    Fallback(Vec<AggregateMetric>),
    /// Nothing buffered and the direct fetch returned no data.
    Empty,
    /// Nothing buffered and the direct fetch failed.
    FallbackFailed,
}

impl Snapshot {
    /// Label used for the `snapshots_total` health counter.
    pub fn source(&self) -> &'static str {
        match self {
            Self::Buffered(_) => "buffered",
            Self::Fallback(_) => "fallback",
            Self::Empty => "empty",
            Self::FallbackFailed => "fallback_failed",
        }
    }

    pub fn metrics(&self) -> &[AggregateMetric] {
        match self {
            Self::Buffered(m) | Self::Fallback(m) => m,
            Self::Empty | Self::FallbackFailed => &[],
        }
    }

    pub fn into_metrics(self) -> Vec<AggregateMetric> {
        match self {
            Self::Buffered(m) | Self::Fallback(m) => m,
            Self::Empty | Self::FallbackFailed => Vec::new(),
        }
    }
}

/// One tick: fetch samples newer than the watermark into the shared buffer.
pub struct FetchTick<F> {
    fetcher: Arc<F>,
    buffer: Arc<MetricsBuffer>,
    health: Option<Arc<HealthMetrics>>,
}

impl<F: Fetcher + 'static> Tick for FetchTick<F> {
    async fn run(&self, since: Option<SystemTime>) -> Result<()> {
        let merged = self.fetcher.merge_since(&self.buffer, since).await?;

        if let Some(h) = &self.health {
            h.samples_merged_total.inc_by(merged as f64);
        }
        debug!(merged, ?since, "merged samples");
        Ok(())
    }
}

/// Owns a fetcher, its aggregation buffer and the tick loop feeding it.
///
/// Several workers can live in one process; nothing is global.
pub struct Worker<F> {
    name: Arc<str>,
    fetcher: Arc<F>,
    buffer: Arc<MetricsBuffer>,
    scheduler: Scheduler,
    health: Option<Arc<HealthMetrics>>,
}

impl<F: Fetcher + 'static> Worker<F> {
    pub fn new(name: impl Into<Arc<str>>, fetcher: F, cfg: &WorkerConfig) -> Self {
        let name = name.into();
        let scheduler = Scheduler::new(Arc::clone(&name), cfg.interval)
            .with_initial_delay(cfg.initial_delay)
            .with_shutdown_timeout(cfg.shutdown_timeout);

        Self {
            name,
            fetcher: Arc::new(fetcher),
            buffer: Arc::new(MetricsBuffer::new()),
            scheduler,
            health: None,
        }
    }

    /// Attaches health metrics to the worker and its tick loop.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.scheduler = self.scheduler.with_health(Arc::clone(&health));
        self.health = Some(health);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn health(&self) -> Option<&HealthMetrics> {
        self.health.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Starts background fetching. Can be called once per worker.
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler.start(Arc::new(FetchTick {
            fetcher: Arc::clone(&self.fetcher),
            buffer: Arc::clone(&self.buffer),
            health: self.health.clone(),
        }))?;

        info!(
            worker = %self.name,
            interval = ?self.scheduler.interval(),
            "worker started",
        );
        Ok(())
    }

    /// Stops background fetching. Buffered data stays available to
    /// `snapshot`.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Blocks until the tick loop terminates, then shuts it down.
    pub async fn wait(&self) -> Result<(), SchedulerError> {
        self.scheduler.wait().await
    }

    /// Drains the buffer, falling back to a single direct fetch when it is
    /// empty. Never fails.
    pub async fn snapshot(&self) -> Snapshot {
        let buffered = self.buffer.extract_all_and_reset();
        let snapshot = if buffered.is_empty() {
            self.fallback().await
        } else {
            Snapshot::Buffered(buffered)
        };

        if let Some(h) = &self.health {
            h.snapshots_total
                .with_label_values(&[snapshot.source()])
                .inc();
            h.snapshot_metrics.set(snapshot.metrics().len() as f64);
        }
        debug!(
            worker = %self.name,
            source = snapshot.source(),
            metrics = snapshot.metrics().len(),
            "snapshot taken",
        );
        snapshot
    }

    /// Returns every aggregate accumulated since the previous call and
    /// clears the buffer. Empty when nothing could be collected.
    pub async fn get_and_clean_metrics(&self) -> Vec<AggregateMetric> {
        self.snapshot().await.into_metrics()
    }

    /// Fetches everything into a throwaway buffer so the result has the same
    /// shape as buffered data. Runs in its own task so a panicking fetcher
    /// is contained.
    async fn fallback(&self) -> Snapshot {
        warn!(worker = %self.name, "buffer empty, fetching metrics directly");

        let fetcher = Arc::clone(&self.fetcher);
        let task = tokio::spawn(async move {
            let samples = fetcher.fetch_all().await?;
            let scratch = MetricsBuffer::new();
            scratch.merge_samples(samples);
            Ok::<_, anyhow::Error>(scratch.extract_all_and_reset())
        });

        match task.await {
            Ok(Ok(metrics)) if metrics.is_empty() => Snapshot::Empty,
            Ok(Ok(metrics)) => Snapshot::Fallback(metrics),
            Ok(Err(e)) => {
                error!(
                    worker = %self.name,
                    error = %format!("{e:#}"),
                    "direct metrics fetch failed",
                );
                Snapshot::FallbackFailed
            }
            Err(e) => {
                error!(worker = %self.name, error = %e, "direct metrics fetch aborted");
                Snapshot::FallbackFailed
            }
        }
    }
}

impl<F> std::fmt::Debug for Worker<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("scheduler", &self.scheduler)
            .field("buffered_keys", &self.buffer.len())
            .finish()
    }
}
