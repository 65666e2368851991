use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the metricbuf agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Identifies this agent instance in logs and reported metrics.
    #[serde(default)]
    pub agent_name: String,

    /// Monitored system connection configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Background fetch loop configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Periodic snapshot reporting configuration.
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Monitored system connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Base HTTP endpoint (e.g., "http://localhost:9540").
    #[serde(default)]
    pub endpoint: String,

    /// Path answering with JSON sample batches. Default: "/metrics/samples".
    #[serde(default = "default_samples_path")]
    pub samples_path: String,

    /// Path checked once at startup. Empty disables the check.
    /// Default: "/healthz".
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Background fetch loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Tick interval. Zero falls back to 5s. Default: 5s.
    #[serde(default = "default_worker_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Delay before the first tick. Default: 5ms.
    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    /// How long stop waits for an in-flight tick. Default: 5s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Periodic snapshot reporting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    /// How often the buffer is drained and reported. Default: 60s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Output format. Default: log.
    #[serde(default)]
    pub format: ReportFormat,

    /// Gauges reported by their max value only.
    /// Default: ["Server State"].
    #[serde(default = "default_snapshot_metrics")]
    pub snapshot_metrics: Vec<String>,
}

/// Reporter output format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Structured tracing events.
    #[default]
    Log,
    /// One JSON object per line on stdout.
    Json,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve health metrics. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_samples_path() -> String {
    "/metrics/samples".to_string()
}

fn default_health_path() -> String {
    "/healthz".to_string()
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_worker_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(5)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_snapshot_metrics() -> Vec<String> {
    vec![crate::report::SERVER_STATE.to_string()]
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            agent_name: String::new(),
            source: SourceConfig::default(),
            worker: WorkerConfig::default(),
            reporter: ReporterConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            samples_path: default_samples_path(),
            health_path: default_health_path(),
            timeout: default_source_timeout(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval: default_worker_interval(),
            initial_delay: default_initial_delay(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            format: ReportFormat::default(),
            snapshot_metrics: default_snapshot_metrics(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.agent_name.is_empty() {
            bail!("agent_name is required");
        }

        if self.source.endpoint.is_empty() {
            bail!("source.endpoint is required");
        }

        if !self.source.endpoint.starts_with("http://")
            && !self.source.endpoint.starts_with("https://")
        {
            bail!(
                "source.endpoint must be an http(s) URL, got {}",
                self.source.endpoint
            );
        }

        if self.source.timeout.is_zero() {
            bail!("source.timeout must be positive");
        }

        if self.worker.shutdown_timeout.is_zero() {
            bail!("worker.shutdown_timeout must be positive");
        }

        if self.reporter.poll_interval.is_zero() {
            bail!("reporter.poll_interval must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}
