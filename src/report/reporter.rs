use std::io::Write;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::ReportedMetric;

/// Destination for reported metric batches. Uses enum dispatch.
pub enum Reporter {
    Log(LogReporter),
    Json(JsonReporter),
}

impl Reporter {
    /// Returns the reporter name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log(_) => "log",
            Self::Json(_) => "json",
        }
    }

    /// Report a batch of metrics collected by `agent`.
    pub fn report(&self, agent: &str, batch: &[ReportedMetric]) -> Result<()> {
        match self {
            Self::Log(r) => r.report(agent, batch),
            Self::Json(r) => r.report(agent, batch),
        }
    }
}

/// Emits one tracing event per metric.
#[derive(Debug, Default)]
pub struct LogReporter;

impl LogReporter {
    pub fn report(&self, agent: &str, batch: &[ReportedMetric]) -> Result<()> {
        for metric in batch {
            match metric {
                ReportedMetric::Snapshot { name, unit, value } => {
                    info!(agent, metric = %name, unit = %unit, value, "snapshot metric");
                }
                ReportedMetric::Aggregate {
                    name,
                    unit,
                    count,
                    sum,
                    min,
                    max,
                    sum_of_squares,
                } => {
                    info!(
                        agent,
                        metric = %name,
                        unit = %unit,
                        count,
                        sum,
                        min,
                        max,
                        sum_of_squares,
                        "aggregate metric",
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    agent: &'a str,
    #[serde(flatten)]
    metric: &'a ReportedMetric,
}

/// Writes one JSON object per metric, newline-delimited.
pub struct JsonReporter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonReporter {
    pub fn stdout() -> Self {
        Self::new(Box::new(std::io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn report(&self, agent: &str, batch: &[ReportedMetric]) -> Result<()> {
        let mut out = self.out.lock();
        for metric in batch {
            serde_json::to_writer(&mut *out, &JsonLine { agent, metric })
                .context("encoding metric")?;
            out.write_all(b"\n").context("writing metric")?;
        }
        out.flush().context("flushing metrics")
    }
}
