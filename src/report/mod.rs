//! Converts worker snapshots into reportable metrics and hands them to a
//! reporter.

pub mod reporter;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::aggregated::AggregateMetric;
use crate::fetcher::Fetcher;
use crate::worker::Worker;

pub use reporter::{JsonReporter, LogReporter, Reporter};

/// Categorical server state gauge. Reported by its max only.
pub const SERVER_STATE: &str = "Server State";

/// A finalized metric ready for output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportedMetric {
    /// A gauge where only the latest-epoch maximum is meaningful.
    Snapshot {
        name: String,
        unit: String,
        value: f64,
    },
    /// Full statistics for the epoch.
    Aggregate {
        name: String,
        unit: String,
        count: u64,
        sum: f64,
        min: f64,
        max: f64,
        sum_of_squares: f64,
    },
}

impl ReportedMetric {
    /// Converts an aggregate, reporting names listed in `snapshot_metrics`
    /// by their max. Returns `None` for an aggregate with no data points.
    pub fn from_aggregate(
        metric: &AggregateMetric,
        snapshot_metrics: &[String],
    ) -> Option<Self> {
        let (Some(min), Some(max)) = (metric.min(), metric.max()) else {
            warn!(metric = %metric.key(), "skipping aggregate with no data points");
            return None;
        };

        let name = metric.name().to_string();
        let unit = metric.unit().to_string();

        if snapshot_metrics.iter().any(|s| s == metric.name()) {
            return Some(Self::Snapshot {
                name,
                unit,
                value: max,
            });
        }

        Some(Self::Aggregate {
            name,
            unit,
            count: metric.count(),
            sum: metric.sum(),
            min,
            max,
            sum_of_squares: metric.sum_of_squares(),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Snapshot { name, .. } | Self::Aggregate { name, .. } => name,
        }
    }
}

/// Drains `worker` once and reports what it collected.
///
/// Reporter failures are logged and swallowed. Returns the number of
/// metrics handed to the reporter.
pub async fn poll_cycle<F: Fetcher + 'static>(
    worker: &Worker<F>,
    reporter: &Reporter,
    snapshot_metrics: &[String],
) -> usize {
    let snapshot = worker.snapshot().await;

    let batch: Vec<ReportedMetric> = snapshot
        .metrics()
        .iter()
        .filter_map(|m| ReportedMetric::from_aggregate(m, snapshot_metrics))
        .collect();

    if batch.is_empty() {
        debug!(worker = %worker.name(), source = snapshot.source(), "nothing to report");
        return 0;
    }

    match reporter.report(worker.name(), &batch) {
        Ok(()) => {
            if let Some(h) = worker.health() {
                h.metrics_reported_total.inc_by(batch.len() as f64);
            }
            debug!(
                worker = %worker.name(),
                reporter = reporter.name(),
                metrics = batch.len(),
                "reported metrics",
            );
            batch.len()
        }
        Err(e) => {
            if let Some(h) = worker.health() {
                h.report_errors_total.inc();
            }
            error!(
                worker = %worker.name(),
                reporter = reporter.name(),
                error = %format!("{e:#}"),
                "reporting metrics failed",
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::SystemTime;

    use anyhow::Result;
    use parking_lot::Mutex;

    use super::*;
    use crate::aggregated::{MetricKey, Sample};
    use crate::config::WorkerConfig;
    use crate::export::HealthMetrics;

    struct FixedFetcher(Vec<Sample>);

    impl Fetcher for FixedFetcher {
        async fn fetch_since(&self, _since: Option<SystemTime>) -> Result<Vec<Sample>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn aggregate(name: &str, values: &[f64]) -> AggregateMetric {
        let mut m = AggregateMetric::new(MetricKey::new(name, "unit"));
        m.add_values(values);
        m
    }

    fn defaults() -> Vec<String> {
        vec![SERVER_STATE.to_string()]
    }

    #[test]
    fn test_server_state_reported_by_max() {
        let m = aggregate(SERVER_STATE, &[1.0, 3.0, 2.0]);
        assert_eq!(
            ReportedMetric::from_aggregate(&m, &defaults()),
            Some(ReportedMetric::Snapshot {
                name: SERVER_STATE.to_string(),
                unit: "unit".to_string(),
                value: 3.0,
            })
        );
    }

    #[test]
    fn test_regular_metric_reports_full_statistics() {
        let m = aggregate("cpu.load", &[10.0, 20.0, 30.0]);
        let Some(ReportedMetric::Aggregate {
            count,
            sum,
            min,
            max,
            sum_of_squares,
            ..
        }) = ReportedMetric::from_aggregate(&m, &defaults())
        else {
            panic!("expected aggregate");
        };

        assert_eq!(count, 3);
        assert_eq!(sum, 60.0);
        assert_eq!(min, 10.0);
        assert_eq!(max, 30.0);
        assert_eq!(sum_of_squares, 1400.0);
    }

    #[test]
    fn test_empty_aggregate_is_skipped() {
        let m = aggregate("idle", &[]);
        assert_eq!(ReportedMetric::from_aggregate(&m, &defaults()), None);
    }

    #[test]
    fn test_custom_snapshot_list() {
        let m = aggregate(SERVER_STATE, &[1.0, 2.0]);
        let reported = ReportedMetric::from_aggregate(&m, &[]).expect("reported");
        assert!(matches!(reported, ReportedMetric::Aggregate { .. }));
        assert_eq!(reported.name(), SERVER_STATE);
    }

    #[tokio::test]
    async fn test_poll_cycle_reports_fallback_snapshot() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let fetcher = FixedFetcher(vec![
            Sample::new(MetricKey::new(SERVER_STATE, "state"), 4.0),
            Sample::with_values(MetricKey::new("heap", "bytes"), vec![1.0, 2.0]),
        ]);
        let worker = Worker::new("node-1", fetcher, &WorkerConfig::default())
            .with_health(Arc::clone(&health));

        let buf = SharedBuf::default();
        let reporter = Reporter::Json(JsonReporter::new(Box::new(buf.clone())));

        let reported = poll_cycle(&worker, &reporter, &defaults()).await;
        assert_eq!(reported, 2);
        assert_eq!(health.metrics_reported_total.get(), 2.0);

        let text = String::from_utf8(buf.0.lock().clone()).expect("utf8");
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"kind\":\"snapshot\""));
        assert!(text.contains("\"agent\":\"node-1\""));
    }

    #[tokio::test]
    async fn test_poll_cycle_with_nothing_to_report() {
        let worker = Worker::new("node-1", FixedFetcher(Vec::new()), &WorkerConfig::default());
        let reporter = Reporter::Log(LogReporter);
        assert_eq!(poll_cycle(&worker, &reporter, &defaults()).await, 0);
    }

    #[tokio::test]
    async fn test_poll_cycle_swallows_reporter_errors() {
        struct BrokenWriter;

        impl Write for BrokenWriter {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("closed"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let fetcher = FixedFetcher(vec![Sample::new(MetricKey::new("heap", "bytes"), 1.0)]);
        let worker = Worker::new("node-1", fetcher, &WorkerConfig::default())
            .with_health(Arc::clone(&health));
        let reporter = Reporter::Json(JsonReporter::new(Box::new(BrokenWriter)));

        assert_eq!(poll_cycle(&worker, &reporter, &defaults()).await, 0);
        assert_eq!(health.report_errors_total.get(), 1.0);
    }
}
