use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ReportFormat};
use crate::export::health::HealthMetrics;
use crate::fetcher::HttpFetcher;
use crate::report::{self, JsonReporter, LogReporter, Reporter};
use crate::worker::Worker;

/// Agent orchestrates the components: health server, fetcher, worker and
/// the periodic reporting loop.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    reporter: Option<Reporter>,
    worker: Option<Arc<Worker<HttpFetcher>>>,
    poll_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let reporter = match cfg.reporter.format {
            ReportFormat::Log => Reporter::Log(LogReporter),
            ReportFormat::Json => Reporter::Json(JsonReporter::stdout()),
        };

        Ok(Self {
            cfg,
            health,
            reporter: Some(reporter),
            worker: None,
            poll_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Replaces the reporter chosen from configuration. Must be called
    /// before `start`.
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start all components.
    ///
    /// Fails if the monitored system cannot be reached. Start is one-shot:
    /// any later call fails before touching a component, even when the
    /// first call failed.
    pub async fn start(&mut self) -> Result<()> {
        let reporter = self
            .reporter
            .take()
            .context("agent already started")?;

        // 1. Health server first so liveness checks respond during startup.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 2. Initial connection to the monitored system.
        let fetcher = HttpFetcher::connect(&self.cfg.source)
            .await
            .context("connecting fetcher")?;

        // 3. Worker with its background fetch loop.
        let worker = Worker::new(self.cfg.agent_name.clone(), fetcher, &self.cfg.worker)
            .with_health(Arc::clone(&self.health));
        worker.start().context("starting worker")?;
        let worker = Arc::new(worker);

        // 4. Reporting loop.
        self.poll_task = Some(self.spawn_poll_loop(Arc::clone(&worker), reporter));
        self.worker = Some(worker);

        info!(
            agent = %self.cfg.agent_name,
            endpoint = %self.cfg.source.endpoint,
            poll_interval = ?self.cfg.reporter.poll_interval,
            "agent fully started",
        );

        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.poll_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "poll loop terminated abnormally");
            }
        }

        if let Some(worker) = self.worker.take() {
            worker.stop().await;
        }

        self.health.stop().await?;

        info!(agent = %self.cfg.agent_name, "agent stopped");
        Ok(())
    }

    /// Spawn the periodic snapshot-and-report loop. The first report
    /// happens one poll interval after start.
    fn spawn_poll_loop(
        &self,
        worker: Arc<Worker<HttpFetcher>>,
        reporter: Reporter,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let poll_interval = self.cfg.reporter.poll_interval;
        let snapshot_metrics = self.cfg.reporter.snapshot_metrics.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + poll_interval;
            let mut ticker = tokio::time::interval_at(start, poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        report::poll_cycle(&worker, &reporter, &snapshot_metrics).await;
                    }
                }
            }
        })
    }
}
