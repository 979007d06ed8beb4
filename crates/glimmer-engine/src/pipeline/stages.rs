use std::io::Write;

use bytes::Bytes;

use crate::caching::DiskCacheKey;
use crate::error::{DecodeError, FetchError};

use super::fetcher::DiskCacheFetcher;
use super::{DataFetcher, DecodeRequest, Stage};

/// One step of the decode pipeline.
///
/// A stage knows where to get bytes from and how to turn those bytes into the final resource.
/// The [`DecodeJob`](super::DecodeJob) drives the stages in order and takes care of
/// cancellation, timeouts and fetcher cleanup.
pub trait StageGenerator<T>: Send + Sync {
    fn stage(&self) -> Stage;

    /// Whether this stage runs at all for `request`.
    fn is_enabled(&self, request: &DecodeRequest<T>) -> bool;

    fn fetcher(&self, request: &DecodeRequest<T>) -> Result<Box<dyn DataFetcher>, FetchError>;

    /// Turns the fetched bytes into the fully transformed resource.
    fn process(&self, request: &DecodeRequest<T>, data: Bytes) -> Result<T, DecodeError>;
}

/// The stages every engine runs, fastest first.
pub fn default_stages<T: 'static>() -> Vec<Box<dyn StageGenerator<T>>> {
    vec![
        Box::new(ResourceCacheStage),
        Box::new(DataCacheStage),
        Box::new(SourceStage),
    ]
}

/// Reads an already transformed resource from the resource disk tier.
#[derive(Debug)]
pub struct ResourceCacheStage;

impl<T> StageGenerator<T> for ResourceCacheStage {
    fn stage(&self) -> Stage {
        Stage::ResourceCache
    }

    fn is_enabled(&self, request: &DecodeRequest<T>) -> bool {
        request.disk_cache_strategy.reads_resource()
    }

    fn fetcher(&self, request: &DecodeRequest<T>) -> Result<Box<dyn DataFetcher>, FetchError> {
        let key = DiskCacheKey::for_resource(&request.key);
        Ok(Box::new(DiskCacheFetcher::new(request.disk.clone(), key)))
    }

    fn process(&self, request: &DecodeRequest<T>, data: Bytes) -> Result<T, DecodeError> {
        request.registry.decode(&data, &request.key, true)
    }
}

/// Decodes and transforms the original bytes from the data disk tier.
#[derive(Debug)]
pub struct DataCacheStage;

impl<T> StageGenerator<T> for DataCacheStage {
    fn stage(&self) -> Stage {
        Stage::DataCache
    }

    fn is_enabled(&self, request: &DecodeRequest<T>) -> bool {
        request.disk_cache_strategy.reads_data()
    }

    fn fetcher(&self, request: &DecodeRequest<T>) -> Result<Box<dyn DataFetcher>, FetchError> {
        let key = DiskCacheKey::for_data(&request.key);
        Ok(Box::new(DiskCacheFetcher::new(request.disk.clone(), key)))
    }

    fn process(&self, request: &DecodeRequest<T>, data: Bytes) -> Result<T, DecodeError> {
        decode_and_transform(request, &data)
    }
}

/// Fetches the original bytes with a registered fetcher.
#[derive(Debug)]
pub struct SourceStage;

impl<T> StageGenerator<T> for SourceStage {
    fn stage(&self) -> Stage {
        Stage::Source
    }

    fn is_enabled(&self, request: &DecodeRequest<T>) -> bool {
        !request.only_retrieve_from_cache
    }

    fn fetcher(&self, request: &DecodeRequest<T>) -> Result<Box<dyn DataFetcher>, FetchError> {
        request.registry.fetcher(&request.key)
    }

    fn process(&self, request: &DecodeRequest<T>, data: Bytes) -> Result<T, DecodeError> {
        if request
            .disk_cache_strategy
            .writes_data(request.key.source())
        {
            let key = DiskCacheKey::for_data(&request.key);
            persist(request, &key, &data);
        }
        decode_and_transform(request, &data)
    }
}

fn decode_and_transform<T>(request: &DecodeRequest<T>, data: &Bytes) -> Result<T, DecodeError> {
    let resource = request.registry.decode(data, &request.key, false)?;
    let resource = request.registry.transform(resource, &request.key)?;

    if request
        .disk_cache_strategy
        .writes_resource(request.key.source())
    {
        if let Some(encoder) = request.registry.encoder() {
            match encoder.encode(&resource) {
                Ok(encoded) => {
                    let key = DiskCacheKey::for_resource(&request.key);
                    persist(request, &key, &encoded);
                }
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        key = %request.key,
                        "Failed to encode resource for disk cache",
                    );
                }
            }
        }
    }

    Ok(resource)
}

/// Writes `data` to the disk cache.
///
/// Disk cache failures never fail a stage, they are only logged.
fn persist<T>(request: &DecodeRequest<T>, key: &DiskCacheKey, data: &Bytes) {
    if let Err(err) = request.disk.put(key, &mut |w: &mut dyn Write| w.write_all(data)) {
        tracing::error!(
            error = &err as &dyn std::error::Error,
            %key,
            "Failed to write disk cache entry",
        );
    }
}
