use std::fmt;
use std::sync::Arc;

use lru::LruCache;

use crate::key::ResourceKey;
use crate::resource::EngineResource;

/// A bounded LRU store of currently unused resources.
///
/// The bound is the sum of the [`size`](EngineResource::size) of all entries. Inserting an entry
/// evicts least recently used entries until the cache fits its bound again.
///
/// Evicted resources are kept aside until they are [taken](Self::take_evicted), so that the
/// owner of the cache can dispose of them after it released its lock.
pub struct MemoryCache<T> {
    entries: LruCache<ResourceKey, Arc<EngineResource<T>>>,
    initial_max_size: u64,
    max_size: u64,
    current_size: u64,
    evicted: Vec<Arc<EngineResource<T>>>,
}

impl<T> MemoryCache<T> {
    /// Creates a memory cache that holds at most `max_size` bytes.
    pub fn new(max_size: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            initial_max_size: max_size,
            max_size,
            current_size: 0,
            evicted: Vec::new(),
        }
    }

    /// Returns every resource evicted since the last call, in eviction order.
    pub fn take_evicted(&mut self) -> Vec<Arc<EngineResource<T>>> {
        std::mem::take(&mut self.evicted)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains(key)
    }

    /// Inserts a resource as the most recently used entry.
    ///
    /// A resource that is larger than the whole cache is accepted, but evicted right away. An existing entry for the same key is replaced and evicted.
    pub fn put(&mut self, key: ResourceKey, resource: Arc<EngineResource<T>>) {
        let size = resource.size();
        if size > self.max_size {
            tracing::trace!(%key, size, "Resource exceeds memory cache size, evicting immediately");
            self.evict(resource);
            return;
        }

        self.current_size += size;
        if let Some(previous) = self.entries.put(key, resource) {
            self.current_size -= previous.size();
            self.evict(previous);
        }
        self.trim_to_size(self.max_size);
    }

    /// Returns the entry for `key`, marking it as most recently used.
    pub fn get(&mut self, key: &ResourceKey) -> Option<Arc<EngineResource<T>>> {
        self.entries.get(key).cloned()
    }

    /// Removes the entry for `key` without evicting it.
    pub fn remove(&mut self, key: &ResourceKey) -> Option<Arc<EngineResource<T>>> {
        let resource = self.entries.pop(key)?;
        self.current_size -= resource.size();
        Some(resource)
    }

    /// Evicts least recently used entries until at most `size` bytes remain.
    pub fn trim_to_size(&mut self, size: u64) {
        while self.current_size > size {
            let Some((_key, resource)) = self.entries.pop_lru() else {
                break;
            };
            self.current_size -= resource.size();
            self.evict(resource);
        }
        metric!(gauge("caches.memory.size") = self.current_size);
    }

    /// Scales the bound relative to the size this cache was created with.
    ///
    /// Entries are evicted right away if the cache no longer fits the new bound.
    pub fn set_size_multiplier(&mut self, multiplier: f32) {
        let multiplier = f64::from(multiplier.max(0.0));
        self.max_size = (self.initial_max_size as f64 * multiplier).round() as u64;
        self.trim_to_size(self.max_size);
    }

    /// Evicts every entry.
    pub fn clear(&mut self) {
        self.trim_to_size(0);
    }

    fn evict(&mut self, resource: Arc<EngineResource<T>>) {
        metric!(counter("caches.memory.evict") += 1);
        self.evicted.push(resource);
    }
}

impl<T> fmt::Debug for MemoryCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.entries.len())
            .field("current_size", &self.current_size)
            .field("max_size", &self.max_size)
            .field("evicted", &self.evicted.len())
            .finish()
    }
}
