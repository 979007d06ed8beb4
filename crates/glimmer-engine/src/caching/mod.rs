//! # Glimmer caching tiers
//!
//! Decoding is expensive, so the engine goes to great lengths to never decode the same thing
//! twice. This module contains the different tiers a decoded resource (or the bytes it was
//! decoded from) can live in, and explains how a resource moves between them.
//!
//! ## In-memory tiers
//!
//! - [`ActiveResources`] holds every resource that is currently referenced by at least one
//!   [`ResourceHandle`](crate::ResourceHandle). Resources in here are never evicted.
//! - [`MemoryCache`] holds resources that nobody references right now. It is bounded by the
//!   total byte size of its entries and evicts in least-recently-used order.
//!
//! A given key lives in at most one of those two tiers at any instant. When the last handle to
//! a resource is dropped, the resource moves from the active tier into the memory cache instead
//! of being disposed right away. This is the *grace window*: a request for the same key that
//! arrives shortly after will pick the resource up from the memory cache and move it back to
//! the active tier, without touching any fetcher or decoder. Only once the memory cache evicts
//! the resource is it handed to the [`ResourceRecycler`](crate::engine::ResourceRecycler).
//!
//! Both tiers are plain data structures without any locking of their own. The
//! [`Engine`](crate::Engine) keeps them behind a single lock together with its job registry,
//! because the "no duplicate decode" guarantee depends on checking all three atomically.
//!
//! ## Disk tiers
//!
//! The disk cache is an external collaborator behind the [`DiskCacheProvider`] trait. It is
//! used for two separate tiers, distinguished by their [`DiskCacheKey`]:
//!
//! - The *resource* tier stores the fully decoded and transformed resource in encoded form. Its
//!   key covers every field of the [`ResourceKey`](crate::ResourceKey).
//! - The *data* tier stores the original, undecoded source bytes. Its key only covers the
//!   source and the signature, so one entry serves every size and transformation.
//!
//! Which tiers are read and written is decided per request by the [`DiskCacheStrategy`].
//! [`FsDiskCache`] is the bundled filesystem implementation.
//!
//! ### Metrics
//!
//! - `caches.memory.evict`: Resources evicted from the memory cache.
//! - `caches.memory.size`: Gauge of the bytes held by the memory cache.
//! - `caches.disk.hit` / `caches.disk.miss`: Disk lookups, tagged with `tier`.
//! - `caches.disk.write`: Entries written to disk, tagged with `tier`.

mod active;
mod disk;
mod memory;

pub use active::ActiveResources;
pub use disk::{
    CleanupStats, DiskCacheKey, DiskCacheKeyBuilder, DiskCacheProvider, DiskCacheStrategy,
    DiskTier, FsDiskCache, NoDiskCache,
};
pub use memory::MemoryCache;
