//! Agent self-observability.

pub mod health;

pub use health::HealthMetrics;
