//! Decoded resources and the handles consumers hold on to.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;

use crate::key::ResourceKey;

/// A decoded, ready-to-use artifact the engine can cache.
pub trait Resource: Send + Sync + 'static {
    /// The approximate number of bytes this resource keeps alive.
    ///
    /// This is the weight the resource has in the bounded
    /// [`MemoryCache`](crate::caching::MemoryCache).
    fn size_bytes(&self) -> u64;
}

impl Resource for Bytes {
    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }
}

impl Resource for Vec<u8> {
    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }
}

impl Resource for String {
    fn size_bytes(&self) -> u64 {
        self.len() as u64
    }
}

/// A decoded resource as it is tracked by the engine.
///
/// Exactly one tier owns an `EngineResource` at a time: the memory cache (while nobody uses
/// it), the active resources (while it is acquired), or a finishing engine job.
pub struct EngineResource<T> {
    key: ResourceKey,
    resource: T,
    size: u64,
    recyclable: bool,
    acquired: AtomicUsize,
}

impl<T: Resource> EngineResource<T> {
    pub(crate) fn new(key: ResourceKey, resource: T, recyclable: bool) -> Self {
        let size = resource.size_bytes();
        Self {
            key,
            resource,
            size,
            recyclable,
            acquired: AtomicUsize::new(0),
        }
    }
}

impl<T> EngineResource<T> {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn get(&self) -> &T {
        &self.resource
    }

    /// The size in bytes, as reported by [`Resource::size_bytes`] when the resource was created.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the resource may be handed to a recycler once it is evicted.
    pub fn is_recyclable(&self) -> bool {
        self.recyclable
    }

    /// The number of outstanding [`ResourceHandle`]s.
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the acquire count, returning `true` if it dropped to zero.
    pub(crate) fn release(&self) -> bool {
        match self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                tracing::error!(key = %self.key, "released a resource that was not acquired");
                false
            }
        }
    }

    pub(crate) fn into_inner(self) -> (ResourceKey, T) {
        (self.key, self.resource)
    }
}

impl<T> fmt::Debug for EngineResource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineResource")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("recyclable", &self.recyclable)
            .field("acquired", &self.acquired())
            .finish()
    }
}

/// Receives resources whose last handle was dropped.
pub(crate) trait Releaser<T>: Send + Sync {
    /// Takes over the reference of the dropped handle.
    fn on_released(&self, resource: Arc<EngineResource<T>>);
}

/// A counted reference to a decoded resource.
///
/// While at least one handle exists, the resource is considered active and will never be
/// evicted or recycled. Dropping the last handle moves the resource into the memory cache,
/// where it can be picked up again by a later request for the same key.
pub struct ResourceHandle<T> {
    resource: ManuallyDrop<Arc<EngineResource<T>>>,
    releaser: Weak<dyn Releaser<T>>,
}

impl<T: Resource> ResourceHandle<T> {
    /// Creates a handle for a resource that was already acquired on its behalf.
    pub(crate) fn from_acquired(
        resource: Arc<EngineResource<T>>,
        releaser: Weak<dyn Releaser<T>>,
    ) -> Self {
        Self {
            resource: ManuallyDrop::new(resource),
            releaser,
        }
    }
}

impl<T> ResourceHandle<T> {
    pub fn key(&self) -> &ResourceKey {
        self.resource.key()
    }

    pub fn size(&self) -> u64 {
        self.resource.size()
    }

    /// Whether two handles refer to the very same decoded resource.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&*self.resource, &*other.resource)
    }

    /// The number of handles currently referring to this resource.
    pub fn acquired(&self) -> usize {
        self.resource.acquired()
    }
}

impl<T> Deref for ResourceHandle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.resource.get()
    }
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        self.resource.acquire();
        Self {
            resource: ManuallyDrop::new(Arc::clone(&*self.resource)),
            releaser: self.releaser.clone(),
        }
    }
}

impl<T> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        // SAFETY: `resource` is not accessed again after being taken here.
        let resource = unsafe { ManuallyDrop::take(&mut self.resource) };
        if resource.release() {
            if let Some(releaser) = self.releaser.upgrade() {
                releaser.on_released(resource);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", self.key())
            .field("acquired", &self.acquired())
            .field("resource", self.resource.get())
            .finish()
    }
}
