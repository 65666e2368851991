//! Buffered metric aggregation for polled monitoring sources.
//!
//! A [`worker::Worker`] runs a background tick loop that fetches raw samples
//! from a [`fetcher::Fetcher`] and folds them into a [`aggregated::MetricsBuffer`].
//! Consumers periodically drain the buffer into per-metric aggregates.

pub mod agent;
pub mod aggregated;
pub mod config;
pub mod export;
pub mod fetcher;
pub mod report;
pub mod worker;
