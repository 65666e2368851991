use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::warn;

use super::aggregate::AggregateMetric;
use super::metric::{MetricKey, Sample};

/// Thread-safe aggregation buffer mapping metric keys to running aggregates.
///
/// Every operation takes the same lock, so merges and extraction fully
/// serialize: an extraction sees each merge either completely or not at all,
/// and a merge that starts after an extraction lands in the next epoch.
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct MetricsBuffer {
    metrics: Mutex<HashMap<MetricKey, AggregateMetric>>,
}

impl MetricsBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges values into the aggregate for `key`, creating it on first use.
    ///
    /// Returns the number of values accepted.
    pub fn merge(&self, key: &MetricKey, values: &[f64]) -> usize {
        let mut metrics = self.metrics.lock();
        Self::merge_locked(&mut metrics, key, values)
    }

    /// Merges a batch of samples under a single lock acquisition.
    ///
    /// A batch is never split across two epochs. Returns the number of
    /// samples that contributed at least one accepted value.
    pub fn merge_samples<I>(&self, samples: I) -> usize
    where
        I: IntoIterator<Item = Sample>,
    {
        let mut metrics = self.metrics.lock();
        let mut merged = 0;
        for sample in samples {
            if Self::merge_locked(&mut metrics, &sample.key, &sample.values) > 0 {
                merged += 1;
            }
        }
        merged
    }

    fn merge_locked(
        metrics: &mut HashMap<MetricKey, AggregateMetric>,
        key: &MetricKey,
        values: &[f64],
    ) -> usize {
        if let Some(existing) = metrics.get_mut(key) {
            return existing.add_values(values);
        }

        let mut aggregate = AggregateMetric::new(key.clone());
        let accepted = aggregate.add_values(values);
        metrics.insert(key.clone(), aggregate);
        accepted
    }

    /// Moves every aggregate out and clears the buffer, starting a new epoch.
    ///
    /// Aggregates with no data points are logged and dropped. The result is
    /// sorted by key and empty if nothing was buffered.
    pub fn extract_all_and_reset(&self) -> Vec<AggregateMetric> {
        let drained = std::mem::take(&mut *self.metrics.lock());

        let mut out = Vec::with_capacity(drained.len());
        for (key, aggregate) in drained {
            if aggregate.is_empty() {
                warn!(metric = %key, "dropping aggregate with no data points");
                continue;
            }
            out.push(aggregate);
        }
        out.sort_unstable_by(|a, b| a.key().cmp(b.key()));
        out
    }

    /// Number of distinct keys in the current epoch.
    pub fn len(&self) -> usize {
        self.metrics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.lock().is_empty()
    }
}
