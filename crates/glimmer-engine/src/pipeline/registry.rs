use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::error::{DecodeError, FetchError};
use crate::key::{ResourceKey, SourceId, TransformationId};

use super::{
    DataFetcher, DataFetcherFactory, DecodeOptions, ResourceDecoder, ResourceEncoder,
    Transformation,
};

/// The fetchers, decoders and transformations available to the pipeline.
///
/// Fetcher factories and decoders are tried in registration order, the first one that claims a
/// source or resource class wins.
pub struct Registry<T> {
    fetchers: Vec<Arc<dyn DataFetcherFactory>>,
    decoders: Vec<Arc<dyn ResourceDecoder<T>>>,
    encoder: Option<Arc<dyn ResourceEncoder<T>>>,
    transformations: FxHashMap<TransformationId, Arc<dyn Transformation<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            fetchers: Vec::new(),
            decoders: Vec::new(),
            encoder: None,
            transformations: FxHashMap::default(),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetcher(mut self, factory: impl DataFetcherFactory + 'static) -> Self {
        self.fetchers.push(Arc::new(factory));
        self
    }

    pub fn with_decoder(mut self, decoder: impl ResourceDecoder<T> + 'static) -> Self {
        self.decoders.push(Arc::new(decoder));
        self
    }

    /// Sets the encoder used to write transformed resources to the resource disk tier.
    ///
    /// Without an encoder the resource tier is never written.
    pub fn with_encoder(mut self, encoder: impl ResourceEncoder<T> + 'static) -> Self {
        self.encoder = Some(Arc::new(encoder));
        self
    }

    /// Registers a transformation under its [`id`](Transformation::id), replacing any previous
    /// transformation with the same id.
    pub fn with_transformation(mut self, transformation: impl Transformation<T> + 'static) -> Self {
        let id = transformation.id().clone();
        self.transformations.insert(id, Arc::new(transformation));
        self
    }

    /// Builds a fetcher for the source bytes of `key`.
    pub fn fetcher(&self, key: &ResourceKey) -> Result<Box<dyn DataFetcher>, FetchError> {
        let source = key.source();
        let factory = self
            .fetcher_factory(source)
            .ok_or_else(|| FetchError::NoFetcher(source.to_string()))?;
        Ok(factory.build(source, key.size()))
    }

    fn fetcher_factory(&self, source: &SourceId) -> Option<&Arc<dyn DataFetcherFactory>> {
        self.fetchers.iter().find(|f| f.handles(source))
    }

    /// Decodes `data` with the first decoder that produces a resource for `key`.
    ///
    /// If all matching decoders fail, the error of the last one is returned.
    pub fn decode(&self, data: &Bytes, key: &ResourceKey, transformed: bool) -> Result<T, DecodeError> {
        let class = key.resource_class();
        let options = DecodeOptions {
            resource_class: class.clone(),
            resize: key.resize(),
            transformed,
        };
        let size = key.size();

        let mut last_error = None;
        let mut handled = false;
        for decoder in self.decoders.iter().filter(|d| d.handles(class)) {
            handled = true;
            match decoder.decode(data, size.width, size.height, &options) {
                Ok(Some(resource)) => return Ok(resource),
                Ok(None) => {}
                Err(err) => {
                    tracing::trace!(error = %err, "Decoder failed, trying next");
                    last_error = Some(err);
                }
            }
        }

        Err(match last_error {
            Some(err) => err,
            None if handled => DecodeError::Unhandled(class.to_string()),
            None => DecodeError::NoDecoder(class.to_string()),
        })
    }

    /// Applies the transformation chain of `key` in order.
    pub fn transform(&self, mut resource: T, key: &ResourceKey) -> Result<T, DecodeError> {
        let size = key.size();
        for id in key.transformations() {
            let transformation = self
                .transformations
                .get(id)
                .ok_or_else(|| DecodeError::UnknownTransformation(id.to_string()))?;
            resource = transformation.transform(resource, size.width, size.height)?;
        }
        Ok(resource)
    }

    pub fn encoder(&self) -> Option<&dyn ResourceEncoder<T>> {
        self.encoder.as_deref()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut transformations: Vec<_> = self.transformations.keys().collect();
        transformations.sort();
        f.debug_struct("Registry")
            .field("fetchers", &self.fetchers.len())
            .field("decoders", &self.decoders.len())
            .field("encoder", &self.encoder.is_some())
            .field("transformations", &transformations)
            .finish()
    }
}
