use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::{DiskCacheKey, DiskCacheProvider};
use crate::error::FetchError;
use crate::key::{Dimensions, SourceId};

/// Produces the undecoded bytes for one pipeline stage.
///
/// A fetcher is created per stage attempt and is used from a single decode job. The job calls
/// [`cleanup`](Self::cleanup) exactly once when it is done with the fetcher, no matter whether
/// the fetch succeeded, failed or was abandoned.
pub trait DataFetcher: Send {
    fn fetch(&mut self) -> BoxFuture<'_, Result<Bytes, FetchError>>;

    /// Signals that the result of an in-progress [`fetch`](Self::fetch) is no longer needed.
    fn cancel(&self) {}

    /// Releases whatever the fetcher holds on to.
    fn cleanup(&mut self) {}
}

/// Creates [`DataFetcher`]s for the sources it understands.
pub trait DataFetcherFactory: Send + Sync {
    fn handles(&self, source: &SourceId) -> bool;

    fn build(&self, source: &SourceId, size: Dimensions) -> Box<dyn DataFetcher>;
}

/// Reads one entry from a disk cache tier.
pub(crate) struct DiskCacheFetcher {
    disk: Arc<dyn DiskCacheProvider>,
    key: DiskCacheKey,
}

impl DiskCacheFetcher {
    pub fn new(disk: Arc<dyn DiskCacheProvider>, key: DiskCacheKey) -> Self {
        Self { disk, key }
    }
}

impl DataFetcher for DiskCacheFetcher {
    fn fetch(&mut self) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        Box::pin(async move {
            match self.disk.get(&self.key) {
                Ok(Some(data)) => Ok(data),
                Ok(None) => Err(FetchError::NotFound),
                Err(err) => {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        key = %self.key,
                        "Failed to read disk cache entry",
                    );
                    Err(err.into())
                }
            }
        })
    }
}

/// Owns a fetcher for the duration of a stage, cleaning it up when dropped.
///
/// A fetch that is abandoned before it resolved, because it timed out or because the future
/// driving it was dropped, is cancelled before the cleanup.
pub(crate) struct FetcherGuard {
    fetcher: Box<dyn DataFetcher>,
    in_flight: bool,
}

impl FetcherGuard {
    pub fn new(fetcher: Box<dyn DataFetcher>) -> Self {
        Self {
            fetcher,
            in_flight: false,
        }
    }

    pub async fn fetch(&mut self, timeout: Option<Duration>) -> Result<Bytes, FetchError> {
        self.in_flight = true;
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.fetcher.fetch())
                .await
                .unwrap_or(Err(FetchError::Timeout(timeout))),
            None => self.fetcher.fetch().await,
        };
        if matches!(result, Err(FetchError::Timeout(_))) {
            self.fetcher.cancel();
        }
        self.in_flight = false;
        result
    }
}

impl Drop for FetcherGuard {
    fn drop(&mut self) {
        if self.in_flight {
            self.fetcher.cancel();
        }
        self.fetcher.cleanup();
    }
}
