//! The engine coordinating loads, the in-memory tiers and decode jobs.
//!
//! [`Engine::load`] resolves a [`ResourceKey`] in this order:
//!
//! 1. A memory cache hit moves the resource into the active tier and calls the callback right
//!    away, on the calling thread.
//! 2. An active hit acquires the resource once more and calls the callback right away.
//! 3. A job that is already decoding the key gets the callback attached.
//! 4. Otherwise a new job is created and its [`DecodeJob`] handed to the [`Executor`].
//!
//! All three lookups happen under a single lock, so there is never more than one decode per key
//! and every concurrent load of a key observes the same outcome. Callbacks are never invoked
//! while that lock is held.
//!
//! ### Metrics
//!
//! - `engine.load`: Every call to [`Engine::load`].
//! - `engine.memory.hit` / `engine.active.hit`: Loads served from the in-memory tiers.
//! - `engine.job.attach`: Loads that joined an in-flight decode.
//! - `engine.job.spawn`: Decodes submitted to the executor.
//! - `decode.cancelled`: Decodes cancelled because their last load was cancelled.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;

use crate::caching::{
    ActiveResources, DiskCacheProvider, DiskCacheStrategy, FsDiskCache, MemoryCache, NoDiskCache,
};
use crate::config::Config;
use crate::error::{LoadError, NoResultError};
use crate::key::ResourceKey;
use crate::pipeline::{
    DecodeJob, DecodeOutcome, DecodeRequest, Registry, StageGenerator, default_stages,
};
use crate::resource::{EngineResource, Releaser, Resource, ResourceHandle};

mod callback;
mod completion;
mod executor;
mod job;

pub use callback::{ResourceCallback, ResourceRecycler};
pub use completion::{Completion, CompletionContext, CompletionQueue, Inline};
pub use executor::{Executor, Priority, TaskHandle, TokioExecutor, WorkerPool};
pub use job::JobStatus;

use job::{BoxedCallback, CallbackId, Detached, EngineJob};

/// Per-load options.
///
/// Only the options of the load that starts a decode are used. Loads that attach to a decode
/// that is already running share its options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub priority: Priority,
    pub disk_cache_strategy: DiskCacheStrategy,
    /// Fail instead of fetching from the source when no disk tier has the resource.
    pub only_retrieve_from_cache: bool,
}

impl LoadOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn disk_cache_strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.disk_cache_strategy = strategy;
        self
    }

    pub fn only_retrieve_from_cache(mut self, only_retrieve_from_cache: bool) -> Self {
        self.only_retrieve_from_cache = only_retrieve_from_cache;
        self
    }
}

trait CancelLoad: Send + Sync {
    fn cancel_load(&self, key: &ResourceKey, generation: u64, callback: CallbackId);
}

#[derive(Debug)]
struct PendingLoad {
    engine: Weak<dyn CancelLoad>,
    key: ResourceKey,
    generation: u64,
    callback: CallbackId,
}

/// Returned from [`Engine::load`], allows to cancel the load.
///
/// Cancelling detaches the callback, which is then never called. The decode itself is only
/// cancelled once no load is waiting for it anymore. Loads that were served from memory right
/// away get a no-op token.
///
/// Dropping the token does *not* cancel the load.
#[derive(Debug, Default)]
pub struct LoadToken {
    pending: Option<PendingLoad>,
}

impl LoadToken {
    fn noop() -> Self {
        Self::default()
    }

    /// Whether the load was already served when [`Engine::load`] returned.
    pub fn is_noop(&self) -> bool {
        self.pending.is_none()
    }

    /// Cancels the load. This has no effect once the callback was dispatched.
    pub fn cancel(&self) {
        let Some(pending) = &self.pending else {
            return;
        };
        if let Some(engine) = pending.engine.upgrade() {
            engine.cancel_load(&pending.key, pending.generation, pending.callback);
        }
    }
}

/// How much of the memory cache [`Engine::trim_memory`] gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimLevel {
    /// Keep the most recently used half of the configured size.
    Moderate,
    /// Evict everything.
    Complete,
}

/// Where a key currently lives, see [`Engine::residency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Referenced by the given number of handles.
    Active(usize),
    /// Unreferenced, but still decoded in the memory cache.
    Memory,
    /// Being decoded.
    InFlight,
    Absent,
}

/// A snapshot of the engine's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub memory_entries: usize,
    pub memory_size: u64,
    pub memory_max_size: u64,
    pub active_entries: usize,
    pub jobs: usize,
}

struct EngineState<T> {
    memory: MemoryCache<T>,
    active: ActiveResources<T>,
    jobs: FxHashMap<ResourceKey, EngineJob<T>>,
    next_generation: u64,
    is_shutdown: bool,
}

struct EngineInner<T> {
    this: Weak<EngineInner<T>>,
    state: Mutex<EngineState<T>>,
    registry: Arc<Registry<T>>,
    disk: Arc<dyn DiskCacheProvider>,
    executor: Arc<dyn Executor>,
    completion: Arc<dyn CompletionContext>,
    recycler: Option<Arc<dyn ResourceRecycler<T>>>,
    stages: Arc<[Box<dyn StageGenerator<T>>]>,
    fetch_timeout: Option<Duration>,
}

/// Loads resources by key, decoding each key at most once at a time and keeping decoded
/// resources around for as long as they are useful.
///
/// The engine is cheap to clone, all clones share the same state.
pub struct Engine<T> {
    inner: Arc<EngineInner<T>>,
}

impl<T> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Resource> Engine<T> {
    pub fn builder(registry: Registry<T>) -> EngineBuilder<T> {
        EngineBuilder::new(registry)
    }

    /// Creates an engine configured by `config`, using a [`FsDiskCache`] when a cache
    /// directory is configured.
    ///
    /// This has to be called from within a tokio runtime.
    pub fn from_config(registry: Registry<T>, config: &Config) -> Result<Self> {
        let mut builder = Self::builder(registry).config(config);
        if let Some(disk) = FsDiskCache::from_config(config).context("failed to create disk cache")? {
            disk.clear_tmp()
                .context("failed to clear disk cache temp directory")?;
            builder = builder.disk_cache(Arc::new(disk));
        }
        builder.build()
    }

    /// Starts loading the resource for `key`.
    ///
    /// If the resource is decoded already, `callback` is called before this returns. Otherwise
    /// it is called through the configured [`CompletionContext`] once the decode finished.
    pub fn load(
        &self,
        key: ResourceKey,
        options: LoadOptions,
        callback: impl ResourceCallback<T>,
    ) -> LoadToken {
        self.inner.load(key, options, Box::new(callback))
    }

    /// Evicts every unreferenced resource from the memory cache.
    pub fn clear_memory(&self) {
        self.inner.with_memory(|memory| memory.clear());
    }

    /// Gives up memory in response to memory pressure.
    pub fn trim_memory(&self, level: TrimLevel) {
        self.inner.with_memory(|memory| match level {
            TrimLevel::Moderate => memory.trim_to_size(memory.max_size() / 2),
            TrimLevel::Complete => memory.clear(),
        });
    }

    /// Scales the memory cache bound relative to its configured size.
    pub fn set_memory_size_multiplier(&self, multiplier: f32) {
        self.inner
            .with_memory(|memory| memory.set_size_multiplier(multiplier));
    }

    /// Cancels every running decode and clears the memory cache.
    ///
    /// Loads that were still waiting receive [`LoadError::Cancelled`]. Any later load fails the
    /// same way right away. Handles that are still held stay valid.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn residency(&self, key: &ResourceKey) -> Residency {
        let state = self.inner.state.lock().unwrap();
        if let Some(acquired) = state.active.acquired(key) {
            Residency::Active(acquired)
        } else if state.memory.contains(key) {
            Residency::Memory
        } else if state.jobs.contains_key(key) {
            Residency::InFlight
        } else {
            Residency::Absent
        }
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock().unwrap();
        EngineStats {
            memory_entries: state.memory.len(),
            memory_size: state.memory.current_size(),
            memory_max_size: state.memory.max_size(),
            active_entries: state.active.len(),
            jobs: state.jobs.len(),
        }
    }
}

impl<T> fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Engine")
            .field("memory", &state.memory)
            .field("active", &state.active)
            .field("jobs", &state.jobs.len())
            .field("is_shutdown", &state.is_shutdown)
            .finish()
    }
}

impl<T: Resource> EngineInner<T> {
    /// Runs `f` on the memory cache, recycling whatever it evicted once the lock is released.
    fn with_memory(&self, f: impl FnOnce(&mut MemoryCache<T>)) {
        let evicted = {
            let mut state = self.state.lock().unwrap();
            f(&mut state.memory);
            state.memory.take_evicted()
        };
        self.recycle(evicted);
    }

    /// Hands evicted resources to the recycler. Must not be called with the state locked.
    fn recycle(&self, evicted: Vec<Arc<EngineResource<T>>>) {
        let Some(recycler) = &self.recycler else {
            return;
        };
        for resource in evicted {
            recycle(recycler.as_ref(), resource);
        }
    }

    fn handle(&self, resource: Arc<EngineResource<T>>) -> ResourceHandle<T> {
        let releaser: Weak<dyn Releaser<T>> = self.this.clone();
        ResourceHandle::from_acquired(resource, releaser)
    }

    fn token(&self, key: ResourceKey, generation: u64, callback: CallbackId) -> LoadToken {
        let engine: Weak<dyn CancelLoad> = self.this.clone();
        LoadToken {
            pending: Some(PendingLoad {
                engine,
                key,
                generation,
                callback,
            }),
        }
    }

    fn load(&self, key: ResourceKey, options: LoadOptions, callback: BoxedCallback<T>) -> LoadToken {
        metric!(counter("engine.load") += 1);

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        if state.is_shutdown {
            drop(guard);
            tracing::debug!(%key, "Rejecting load after shutdown");
            callback.on_load_failed(LoadError::Cancelled);
            return LoadToken::noop();
        }

        if let Some(resource) = state.memory.remove(&key) {
            resource.acquire();
            state.active.activate(Arc::clone(&resource));
            drop(guard);

            tracing::trace!(%key, "Loaded resource from memory cache");
            metric!(counter("engine.memory.hit") += 1);
            callback.on_resource_ready(self.handle(resource));
            return LoadToken::noop();
        }

        if let Some(resource) = state.active.acquire(&key) {
            drop(guard);

            tracing::trace!(%key, "Loaded active resource");
            metric!(counter("engine.active.hit") += 1);
            callback.on_resource_ready(self.handle(resource));
            return LoadToken::noop();
        }

        let callback = match state.jobs.get_mut(&key) {
            Some(job) => match job.attach(callback) {
                Ok(id) => {
                    let generation = job.generation();
                    let loads = job.callbacks();
                    drop(guard);

                    tracing::trace!(%key, loads, "Attached load to running job");
                    metric!(counter("engine.job.attach") += 1);
                    return self.token(key, generation, id);
                }
                Err((err, callback)) => {
                    tracing::warn!(%key, error = %err, "Discarding finished job");
                    state.jobs.remove(&key);
                    callback
                }
            },
            None => callback,
        };

        let generation = state.next_generation;
        state.next_generation += 1;
        let (mut job, id) = EngineJob::new(key.clone(), generation, callback);

        let request = DecodeRequest {
            key: key.clone(),
            disk_cache_strategy: options.disk_cache_strategy,
            only_retrieve_from_cache: options.only_retrieve_from_cache,
            registry: Arc::clone(&self.registry),
            disk: Arc::clone(&self.disk),
            fetch_timeout: self.fetch_timeout,
        };
        let decode = DecodeJob::new(
            request,
            Arc::clone(&self.stages),
            job.cancellation_token(),
        );

        let engine = self.this.clone();
        let task_key = key.clone();
        let task = async move {
            let outcome = match AssertUnwindSafe(decode.run()).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(key = %task_key, "Decode panicked");
                    DecodeOutcome::Failed(NoResultError::default())
                }
            };
            if let Some(engine) = engine.upgrade() {
                engine.finish_job(task_key, generation, outcome);
            }
        };

        job.start(self.executor.execute(options.priority, task.boxed()));
        tracing::debug!(%key, generation, priority = ?options.priority, "Started decode job");
        state.jobs.insert(key.clone(), job);
        drop(guard);

        metric!(counter("engine.job.spawn") += 1);
        self.token(key, generation, id)
    }

    /// Publishes the outcome of a decode to every load waiting for it.
    ///
    /// The job is removed from the registry in the same critical section that publishes the
    /// resource, so a new load either attaches to the job or finds the active resource.
    fn finish_job(&self, key: ResourceKey, generation: u64, outcome: DecodeOutcome<T>) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        match state.jobs.get(&key) {
            Some(job) if job.generation() == generation => {}
            _ if matches!(outcome, DecodeOutcome::Cancelled) => {
                tracing::debug!(%key, generation, "Cancelled decode job finished");
                return;
            }
            _ => {
                tracing::debug!(%key, generation, "Discarding outcome of unregistered job");
                return;
            }
        }
        let Some(mut job) = state.jobs.remove(&key) else {
            return;
        };

        match outcome {
            DecodeOutcome::Complete { resource, stage } => {
                let Some(callbacks) = job.complete() else {
                    return;
                };
                let resource = Arc::new(EngineResource::new(key.clone(), resource, true));
                tracing::debug!(%key, %stage, loads = callbacks.len(), "Decode job completed");

                if callbacks.is_empty() {
                    state.memory.put(key, resource);
                    let evicted = state.memory.take_evicted();
                    drop(guard);
                    self.recycle(evicted);
                    return;
                }

                let ready: Vec<_> = callbacks
                    .into_iter()
                    .map(|callback| {
                        resource.acquire();
                        (callback, self.handle(Arc::clone(&resource)))
                    })
                    .collect();
                state.active.activate(resource);
                drop(guard);

                for (callback, handle) in ready {
                    self.completion
                        .dispatch(Box::new(move || callback.on_resource_ready(handle)));
                }
            }
            DecodeOutcome::Failed(err) => {
                let Some(callbacks) = job.fail() else {
                    return;
                };
                drop(guard);

                tracing::debug!(%key, loads = callbacks.len(), "Decode job failed");
                let error = LoadError::from(err);
                self.dispatch_failure(callbacks, error);
            }
            DecodeOutcome::Cancelled => {
                // the token of a registered job is only cancelled by shutdown, which also
                // deregisters it, so this is a decode that noticed a cancellation late
                let callbacks = job.shutdown();
                drop(guard);
                self.dispatch_failure(callbacks, LoadError::Cancelled);
            }
        }
    }

    fn dispatch_failure(&self, callbacks: Vec<BoxedCallback<T>>, error: LoadError) {
        for callback in callbacks {
            let error = error.clone();
            self.completion
                .dispatch(Box::new(move || callback.on_load_failed(error)));
        }
    }

    fn shutdown(&self) {
        let (callbacks, evicted): (Vec<_>, _) = {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
            let callbacks = state
                .jobs
                .drain()
                .flat_map(|(_, mut job)| job.shutdown())
                .collect();
            state.memory.clear();
            (callbacks, state.memory.take_evicted())
        };

        tracing::debug!(loads = callbacks.len(), "Engine shut down");
        self.recycle(evicted);
        self.dispatch_failure(callbacks, LoadError::Cancelled);
    }
}

impl<T: Resource> Releaser<T> for EngineInner<T> {
    fn on_released(&self, resource: Arc<EngineResource<T>>) {
        let evicted = {
            let mut guard = self.state.lock().unwrap();
            let state = &mut *guard;
            state.active.release(&resource, &mut state.memory);
            if state.is_shutdown {
                state.memory.clear();
            }
            state.memory.take_evicted()
        };
        // the released reference must be gone before recycling can take the resource apart
        drop(resource);
        self.recycle(evicted);
    }
}

impl<T: Resource> CancelLoad for EngineInner<T> {
    fn cancel_load(&self, key: &ResourceKey, generation: u64, callback: CallbackId) {
        let detached = {
            let mut state = self.state.lock().unwrap();
            let Some(job) = state
                .jobs
                .get_mut(key)
                .filter(|job| job.generation() == generation)
            else {
                return;
            };
            let detached = job.remove(callback);
            if let Detached::Cancelled(_) = detached {
                state.jobs.remove(key);
                tracing::debug!(%key, "Cancelled decode job without remaining loads");
                metric!(counter("decode.cancelled") += 1);
            }
            detached
        };
        // the callback may own handles, which must be released without holding the lock
        drop(detached);
    }
}

impl<T> Drop for EngineInner<T> {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.active.is_empty() {
            tracing::warn!(
                resources = state.active.len(),
                "Engine dropped while resources are still referenced"
            );
        }
    }
}

fn recycle<T>(recycler: &dyn ResourceRecycler<T>, resource: Arc<EngineResource<T>>) {
    if !resource.is_recyclable() {
        return;
    }
    match Arc::try_unwrap(resource) {
        Ok(resource) => {
            let (key, resource) = resource.into_inner();
            tracing::trace!(%key, "Recycling evicted resource");
            let recycled = panic::catch_unwind(AssertUnwindSafe(|| {
                recycler.recycle(key.clone(), resource)
            }));
            if recycled.is_err() {
                tracing::error!(%key, "Recycler panicked");
            }
        }
        Err(resource) => {
            tracing::trace!(key = %resource.key(), "Evicted resource is still shared, not recycling");
        }
    }
}

/// Configures and creates an [`Engine`].
pub struct EngineBuilder<T> {
    registry: Registry<T>,
    memory_cache_size: u64,
    disk: Option<Arc<dyn DiskCacheProvider>>,
    executor: Option<Arc<dyn Executor>>,
    completion: Arc<dyn CompletionContext>,
    recycler: Option<Arc<dyn ResourceRecycler<T>>>,
    stages: Option<Vec<Box<dyn StageGenerator<T>>>>,
    fetch_timeout: Option<Duration>,
    max_concurrent_decodes: usize,
}

impl<T: Resource> EngineBuilder<T> {
    pub fn new(registry: Registry<T>) -> Self {
        let config = Config::default();
        Self {
            registry,
            memory_cache_size: config.caches.memory.max_size,
            disk: None,
            executor: None,
            completion: Arc::new(Inline),
            recycler: None,
            stages: None,
            fetch_timeout: config.fetch_timeout,
            max_concurrent_decodes: config.max_concurrent_decodes,
        }
    }

    /// Takes the memory cache size, fetch timeout and decode concurrency from `config`.
    pub fn config(mut self, config: &Config) -> Self {
        self.memory_cache_size = config.caches.memory.max_size;
        self.fetch_timeout = config.fetch_timeout;
        self.max_concurrent_decodes = config.max_concurrent_decodes;
        self
    }

    pub fn memory_cache_size(mut self, max_size: u64) -> Self {
        self.memory_cache_size = max_size;
        self
    }

    /// Sets the provider backing both disk tiers. Without one, nothing is cached on disk.
    pub fn disk_cache(mut self, disk: Arc<dyn DiskCacheProvider>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Sets the executor decode jobs run on.
    ///
    /// Defaults to a [`WorkerPool`] with `max_concurrent_decodes` workers on the current runtime.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets where callbacks of decoded loads run. Defaults to [`Inline`].
    pub fn completion_context(mut self, completion: Arc<dyn CompletionContext>) -> Self {
        self.completion = completion;
        self
    }

    pub fn recycler(mut self, recycler: Arc<dyn ResourceRecycler<T>>) -> Self {
        self.recycler = Some(recycler);
        self
    }

    /// Replaces the [`default_stages`] of the decode pipeline.
    pub fn stages(mut self, stages: Vec<Box<dyn StageGenerator<T>>>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn max_concurrent_decodes(mut self, workers: usize) -> Self {
        self.max_concurrent_decodes = workers;
        self
    }

    pub fn build(self) -> Result<Engine<T>> {
        let executor: Arc<dyn Executor> = match self.executor {
            Some(executor) => executor,
            None => {
                let runtime = Handle::try_current()
                    .context("the default executor needs to be created within a tokio runtime")?;
                Arc::new(WorkerPool::new(&runtime, self.max_concurrent_decodes))
            }
        };

        let state = EngineState {
            memory: MemoryCache::new(self.memory_cache_size),
            active: ActiveResources::default(),
            jobs: FxHashMap::default(),
            next_generation: 0,
            is_shutdown: false,
        };
        let disk = self.disk.unwrap_or_else(|| Arc::new(NoDiskCache));
        let stages = self.stages.unwrap_or_else(default_stages);

        let inner = Arc::new_cyclic(|this| EngineInner {
            this: this.clone(),
            state: Mutex::new(state),
            registry: Arc::new(self.registry),
            disk,
            executor,
            completion: self.completion,
            recycler: self.recycler,
            stages: stages.into(),
            fetch_timeout: self.fetch_timeout,
        });
        Ok(Engine { inner })
    }
}
