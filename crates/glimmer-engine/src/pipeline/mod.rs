//! The decode pipeline.
//!
//! A [`DecodeJob`] produces a resource by trying a list of [`StageGenerator`]s in order:
//!
//! 1. [`Stage::ResourceCache`]: an already transformed resource from the resource disk tier.
//! 2. [`Stage::DataCache`]: the original bytes from the data disk tier, decoded and transformed.
//! 3. [`Stage::Source`]: the original bytes from a registered [`DataFetcher`].
//!
//! The first stage that produces a resource wins. A stage failure is recorded and the next stage
//! is tried; only when every stage failed does the job fail, with a [`NoResultError`] carrying
//! the error of each stage.
//!
//! The fetchers, decoders and transformations the stages use are looked up in a [`Registry`].
//!
//! [`NoResultError`]: crate::NoResultError

use std::fmt;

mod decode_job;
mod decoder;
mod fetcher;
mod registry;
mod stages;

pub use decode_job::{DecodeJob, DecodeOutcome, DecodeRequest};
pub use decoder::{DecodeOptions, ResourceDecoder, ResourceEncoder, Transformation};
pub use fetcher::{DataFetcher, DataFetcherFactory};
pub use registry::Registry;
pub use stages::{DataCacheStage, ResourceCacheStage, SourceStage, StageGenerator, default_stages};

/// Identifies a step of the decode pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ResourceCache,
    DataCache,
    Source,
}

impl Stage {
    /// The name used for metric tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ResourceCache => "resource_cache",
            Stage::DataCache => "data_cache",
            Stage::Source => "source",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ResourceCache => "resource cache",
            Stage::DataCache => "data cache",
            Stage::Source => "source",
        })
    }
}
