use std::fmt;
use std::sync::Arc;

/// Identity key for metric aggregation: metric name plus unit.
///
/// Two samples with equal keys always merge into the same aggregate.
/// Cloning is cheap; both parts are reference-counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    name: Arc<str>,
    unit: Arc<str>,
}

impl MetricKey {
    /// Creates a key from a metric name and unit.
    pub fn new(name: impl Into<Arc<str>>, unit: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
        }
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the metric unit.
    pub fn unit(&self) -> &str {
        &self.unit
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.unit)
    }
}

/// A raw observation produced by a fetcher: one key and the values seen for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub key: MetricKey,
    pub values: Vec<f64>,
}

impl Sample {
    /// Creates a sample carrying a single value.
    pub fn new(key: MetricKey, value: f64) -> Self {
        Self {
            key,
            values: vec![value],
        }
    }

    /// Creates a sample carrying several values for the same key.
    pub fn with_values(key: MetricKey, values: Vec<f64>) -> Self {
        Self { key, values }
    }
}
