//! A keyed, deduplicating, reference-counted resource loading engine.
//!
//! The [`Engine`](engine::Engine) turns a [`ResourceKey`](key::ResourceKey) into a shared,
//! decoded resource. Requests are served from the in-memory tiers when possible, concurrent
//! requests for the same key are coalesced into a single decode, and decoded resources are
//! handed out as [`ResourceHandle`](resource::ResourceHandle)s which release themselves back
//! into the memory cache once the last one is dropped.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod logging;
pub mod pipeline;
pub mod resource;
pub mod utils;

pub use engine::{Engine, EngineBuilder, LoadOptions, LoadToken, Priority};
pub use error::{DecodeError, FetchError, LoadError, NoResultError, StageError};
pub use key::{Dimensions, ResizeStrategy, ResourceClass, ResourceKey, SourceId, TransformationId};
pub use resource::{Resource, ResourceHandle};
