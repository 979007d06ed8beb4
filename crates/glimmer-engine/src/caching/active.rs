use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::key::ResourceKey;
use crate::resource::EngineResource;

use super::MemoryCache;

/// The registry of resources that are currently referenced by at least one consumer.
///
/// Membership mirrors the acquire count of the resource: an entry exists while the count is
/// above zero. The count itself is atomic and lives on the [`EngineResource`], so handles can be
/// cloned and dropped without touching this map; the map is only consulted when a count crosses
/// zero.
pub struct ActiveResources<T> {
    entries: FxHashMap<ResourceKey, Arc<EngineResource<T>>>,
}

impl<T> Default for ActiveResources<T> {
    fn default() -> Self {
        Self {
            entries: FxHashMap::default(),
        }
    }
}

impl<T> ActiveResources<T> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Returns the acquire count of the active resource for `key`.
    pub fn acquired(&self, key: &ResourceKey) -> Option<usize> {
        self.entries.get(key).map(|r| r.acquired())
    }

    /// Acquires the active resource for `key`, incrementing its count.
    pub fn acquire(&mut self, key: &ResourceKey) -> Option<Arc<EngineResource<T>>> {
        let resource = self.entries.get(key)?;
        resource.acquire();
        Some(Arc::clone(resource))
    }

    /// Registers a resource that was already acquired on behalf of its consumers.
    ///
    /// Returns the resource that was previously registered for the same key, if any.
    pub fn activate(&mut self, resource: Arc<EngineResource<T>>) -> Option<Arc<EngineResource<T>>> {
        debug_assert!(resource.acquired() > 0, "activating an unreferenced resource");
        self.entries.insert(resource.key().clone(), resource)
    }

    /// Moves a resource whose count dropped to zero into the memory cache.
    ///
    /// This is a no-op if the resource was re-acquired in the meantime, or if a different
    /// resource is registered for its key. Returns `true` if the resource was moved.
    pub fn release(
        &mut self,
        resource: &Arc<EngineResource<T>>,
        memory: &mut MemoryCache<T>,
    ) -> bool {
        let key = resource.key();
        match self.entries.get(key) {
            Some(active) if Arc::ptr_eq(active, resource) && resource.acquired() == 0 => {}
            _ => return false,
        }
        let Some(resource) = self.entries.remove(key) else {
            return false;
        };
        tracing::trace!(%key, "Moving released resource into memory cache");
        memory.put(key.clone(), resource);
        true
    }
}

impl<T> fmt::Debug for ActiveResources<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveResources")
            .field("entries", &self.entries.len())
            .finish()
    }
}
