//! Per-metric aggregation: keys, running aggregates, and the shared buffer.

pub mod aggregate;
pub mod buffer;
pub mod metric;

pub use aggregate::AggregateMetric;
pub use buffer::MetricsBuffer;
pub use metric::{MetricKey, Sample};
