use tracing::warn;

use super::metric::MetricKey;

/// Running statistics for one metric key over one aggregation epoch.
///
/// Tracks count, sum, min, max and sum of squares incrementally; the raw
/// values are never retained. Min is initialized to +inf and max to -inf so
/// the first recorded value sets both.
///
/// This is a plain value: cloning it yields an independent aggregate, and
/// extracting it from a buffer moves it out.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateMetric {
    key: MetricKey,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    sum_of_squares: f64,
}

impl AggregateMetric {
    /// Creates an empty aggregate for the given key.
    pub fn new(key: MetricKey) -> Self {
        Self {
            key,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum_of_squares: 0.0,
        }
    }

    /// Records values, returning how many were accepted.
    ///
    /// Non-finite values are rejected and logged, never counted, so
    /// `min <= mean <= max` holds for every populated aggregate.
    pub fn add_values(&mut self, values: &[f64]) -> usize {
        let mut accepted = 0;
        for &value in values {
            if !value.is_finite() {
                warn!(metric = %self.key, value, "rejecting non-finite value");
                continue;
            }
            self.count += 1;
            self.sum += value;
            self.sum_of_squares += value * value;
            self.min = self.min.min(value);
            self.max = self.max.max(value);
            accepted += 1;
        }
        accepted
    }

    /// Records a single value.
    pub fn add_value(&mut self, value: f64) -> bool {
        self.add_values(&[value]) == 1
    }

    pub fn key(&self) -> &MetricKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        self.key.name()
    }

    pub fn unit(&self) -> &str {
        self.key.unit()
    }

    /// Number of data points recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.sum_of_squares
    }

    /// Smallest recorded value, `None` until the first value arrives.
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest recorded value, `None` until the first value arrives.
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// Returns true if no value has been recorded.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
