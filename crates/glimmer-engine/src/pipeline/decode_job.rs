use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::caching::{DiskCacheProvider, DiskCacheStrategy};
use crate::error::{NoResultError, StageError};
use crate::key::ResourceKey;

use super::fetcher::FetcherGuard;
use super::{Registry, Stage, StageGenerator};

/// Everything a [`StageGenerator`] needs to know about a single load.
pub struct DecodeRequest<T> {
    pub key: ResourceKey,
    pub disk_cache_strategy: DiskCacheStrategy,
    /// Skip the [`Source`](Stage::Source) stage, so a miss in every cache fails the load.
    pub only_retrieve_from_cache: bool,
    pub registry: Arc<Registry<T>>,
    pub disk: Arc<dyn DiskCacheProvider>,
    pub fetch_timeout: Option<Duration>,
}

impl<T> fmt::Debug for DecodeRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeRequest")
            .field("key", &self.key)
            .field("disk_cache_strategy", &self.disk_cache_strategy)
            .field("only_retrieve_from_cache", &self.only_retrieve_from_cache)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish()
    }
}

/// The result of running a [`DecodeJob`] to completion.
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    /// A stage produced the resource.
    Complete { resource: T, stage: Stage },
    /// Every enabled stage failed, the causes are in stage order.
    Failed(NoResultError),
    /// The job noticed its cancellation token before producing a result.
    Cancelled,
}

enum StageOutcome<T> {
    Complete(T),
    Failed(StageError),
    Cancelled,
}

/// Produces one resource by trying each stage in turn until one succeeds.
pub struct DecodeJob<T> {
    request: DecodeRequest<T>,
    stages: Arc<[Box<dyn StageGenerator<T>>]>,
    cancel: CancellationToken,
}

impl<T> DecodeJob<T> {
    pub fn new(
        request: DecodeRequest<T>,
        stages: Arc<[Box<dyn StageGenerator<T>>]>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request,
            stages,
            cancel,
        }
    }

    /// Runs the stages in order, stopping at the first one that produces a resource.
    ///
    /// Cancellation is checked between stages, while fetching, and before decoding. Fetchers are
    /// cleaned up in every case, including when this future is dropped.
    pub async fn run(self) -> DecodeOutcome<T> {
        let span = tracing::debug_span!("decode", key = %self.request.key);
        self.run_stages().instrument(span).await
    }

    async fn run_stages(&self) -> DecodeOutcome<T> {
        let mut causes = Vec::new();

        for generator in self.stages.iter() {
            let stage = generator.stage();
            if self.cancel.is_cancelled() {
                return self.cancelled(stage);
            }
            if !generator.is_enabled(&self.request) {
                tracing::trace!(%stage, "Skipping disabled stage");
                continue;
            }

            tracing::trace!(%stage, "Running stage");
            match self.run_stage(generator.as_ref()).await {
                StageOutcome::Complete(resource) => {
                    tracing::trace!(%stage, "Stage produced resource");
                    metric!(counter("decode.stage.hit") += 1, "stage" => stage.as_str());
                    return DecodeOutcome::Complete { resource, stage };
                }
                StageOutcome::Failed(err) => {
                    tracing::trace!(error = %err, "Stage failed, falling through");
                    causes.push(err);
                }
                StageOutcome::Cancelled => return self.cancelled(stage),
            }
        }

        let err = NoResultError::new(causes);
        tracing::debug!(error = %err, "Decode failed");
        metric!(counter("decode.failed") += 1);
        DecodeOutcome::Failed(err)
    }

    async fn run_stage(&self, generator: &dyn StageGenerator<T>) -> StageOutcome<T> {
        let stage = generator.stage();
        let mut fetcher = match generator.fetcher(&self.request) {
            Ok(fetcher) => FetcherGuard::new(fetcher),
            Err(err) => return StageOutcome::Failed(StageError::new(stage, err)),
        };

        // dropping the pending fetch leaves it in flight, so the guard cancels it
        let fetched = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = fetcher.fetch(self.request.fetch_timeout) => Some(result),
        };

        let data = match fetched {
            None => return StageOutcome::Cancelled,
            Some(Err(err)) => return StageOutcome::Failed(StageError::new(stage, err)),
            Some(Ok(data)) => data,
        };
        drop(fetcher);

        if self.cancel.is_cancelled() {
            return StageOutcome::Cancelled;
        }

        match generator.process(&self.request, data) {
            Ok(resource) => StageOutcome::Complete(resource),
            Err(err) => StageOutcome::Failed(StageError::new(stage, err)),
        }
    }

    fn cancelled(&self, stage: Stage) -> DecodeOutcome<T> {
        tracing::debug!(%stage, "Decode cancelled");
        DecodeOutcome::Cancelled
    }
}
