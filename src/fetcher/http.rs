use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::aggregated::{MetricKey, Sample};
use crate::config::SourceConfig;

use super::Fetcher;

/// HTTP sample source returning JSON sample batches.
///
/// `GET {endpoint}{samples_path}` answers with a JSON array of
/// `{"name": .., "unit": .., "values": [..]}` objects. When a watermark is
/// known it is passed as `?since=<unix millis>`.
pub struct HttpFetcher {
    http: reqwest::Client,
    endpoint: String,
    samples_path: String,
}

#[derive(Deserialize)]
struct SampleJson {
    name: String,
    unit: String,
    #[serde(default)]
    values: Vec<f64>,
}

impl HttpFetcher {
    /// Builds the client and verifies the monitored system is reachable.
    ///
    /// Failure here is a configuration error: the agent cannot run without
    /// an initial connection.
    pub async fn connect(cfg: &SourceConfig) -> Result<Self> {
        let fetcher = Self::new(cfg)?;

        if cfg.health_path.is_empty() {
            debug!("no health path configured, skipping connectivity check");
        } else {
            fetcher
                .check_health(&cfg.health_path)
                .await
                .with_context(|| format!("connecting to sample source {}", cfg.endpoint))?;
        }

        info!(endpoint = %cfg.endpoint, "connected to sample source");
        Ok(fetcher)
    }

    /// Builds the client without contacting the source.
    pub fn new(cfg: &SourceConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            samples_path: cfg.samples_path.clone(),
        })
    }

    async fn check_health(&self, path: &str) -> Result<()> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("unexpected status {} from {}", status, path);
        }
        Ok(())
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch_since(&self, since: Option<SystemTime>) -> Result<Vec<Sample>> {
        let url = format!("{}{}", self.endpoint, self.samples_path);
        let mut request = self.http.get(&url).header("Accept", "application/json");
        if let Some(since) = since {
            request = request.query(&[("since", unix_millis(since))]);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {}", self.samples_path))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "unexpected status {} from {}: {}",
                status,
                self.samples_path,
                body
            );
        }

        let raw: Vec<SampleJson> = response
            .json()
            .await
            .with_context(|| format!("decoding samples from {}", self.samples_path))?;

        debug!(samples = raw.len(), ?since, "fetched samples");

        Ok(raw
            .into_iter()
            .map(|s| Sample::with_values(MetricKey::new(s.name, s.unit), s.values))
            .collect())
    }
}

/// Milliseconds since the Unix epoch, clamped to zero for earlier times.
fn unix_millis(t: SystemTime) -> u64 {
    u64::try_from(
        t.duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}
