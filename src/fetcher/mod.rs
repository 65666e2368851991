pub mod http;

use std::future::Future;
use std::time::SystemTime;

use anyhow::Result;

use crate::aggregated::{MetricsBuffer, Sample};

pub use http::HttpFetcher;

/// Source of raw metric samples from the monitored system.
///
/// Only `fetch_since` is required. `fetch_all` and `merge_since` are built on
/// top of it and can be overridden by sources with cheaper paths.
pub trait Fetcher: Send + Sync {
    /// Fetch samples observed after `since`, or everything currently
    /// available when `since` is `None`.
    fn fetch_since(
        &self,
        since: Option<SystemTime>,
    ) -> impl Future<Output = Result<Vec<Sample>>> + Send;

    /// Fetch samples unconditionally.
    fn fetch_all(&self) -> impl Future<Output = Result<Vec<Sample>>> + Send {
        self.fetch_since(None)
    }

    /// Fetch samples newer than `since` and merge them into `buffer`.
    ///
    /// The whole batch is merged under one buffer lock. Returns the number of
    /// samples that contributed at least one accepted value.
    fn merge_since(
        &self,
        buffer: &MetricsBuffer,
        since: Option<SystemTime>,
    ) -> impl Future<Output = Result<usize>> + Send {
        async move {
            let samples = self.fetch_since(since).await?;
            Ok(buffer.merge_samples(samples))
        }
    }
}
