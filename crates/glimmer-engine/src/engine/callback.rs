use crate::error::LoadError;
use crate::key::ResourceKey;
use crate::resource::ResourceHandle;

/// Receives the outcome of a single [`load`](super::Engine::load).
///
/// Exactly one of the two methods is called, exactly once, unless the load is cancelled through
/// its [`LoadToken`](super::LoadToken), in which case neither is.
///
/// Any `FnOnce(Result<ResourceHandle<T>, LoadError>)` closure is a callback.
pub trait ResourceCallback<T>: Send + 'static {
    fn on_resource_ready(self: Box<Self>, resource: ResourceHandle<T>);

    fn on_load_failed(self: Box<Self>, error: LoadError);
}

impl<T, F> ResourceCallback<T> for F
where
    F: FnOnce(Result<ResourceHandle<T>, LoadError>) + Send + 'static,
{
    fn on_resource_ready(self: Box<Self>, resource: ResourceHandle<T>) {
        (*self)(Ok(resource))
    }

    fn on_load_failed(self: Box<Self>, error: LoadError) {
        (*self)(Err(error))
    }
}

/// Takes back decoded resources once the memory cache evicts them.
///
/// This is the hook for pooling the memory backing decoded resources. It is called after the
/// engine released its internal lock, on whichever thread caused the eviction. A panic in the
/// recycler is logged, the resource is lost.
pub trait ResourceRecycler<T>: Send + Sync {
    fn recycle(&self, key: ResourceKey, resource: T);
}

impl<T, F> ResourceRecycler<T> for F
where
    F: Fn(ResourceKey, T) + Send + Sync,
{
    fn recycle(&self, key: ResourceKey, resource: T) {
        self(key, resource)
    }
}
