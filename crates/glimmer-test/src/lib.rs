//! Helpers for testing the engine.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the disk cache directory is deleted
//!    from under the engine. To avoid this, assign it to a variable in the test function (e.g.
//!    `let _cache_dir = test::tempdir()`).
//!
//!  - A [`TestSource`] counts every fetch per path, like a hit counter on a real server. Use
//!    [`TestSource::gated`] to hold fetches back until the test is ready to let them finish.

use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Notify, watch};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use glimmer_engine::caching::{DiskCacheKey, DiskCacheProvider, DiskTier};
use glimmer_engine::engine::{ResourceCallback, ResourceRecycler};
use glimmer_engine::pipeline::{
    DataFetcher, DataFetcherFactory, DecodeOptions, ResourceDecoder, ResourceEncoder,
    Transformation,
};
use glimmer_engine::{
    DecodeError, Dimensions, FetchError, LoadError, Resource, ResourceClass, ResourceHandle,
    ResourceKey, SourceId, TransformationId,
};

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `glimmer_engine` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("glimmer_engine=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A decoded "image": some pixel bytes and the names of the transformations applied to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
    pub applied: Vec<String>,
}

impl TestImage {
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            pixels: pixels.into(),
            applied: Vec::new(),
        }
    }

    /// The encoded form as stored in the resource disk tier.
    ///
    /// This is a `{width}x{height};{applied,...}` header line followed by the pixels.
    pub fn encode(&self) -> Bytes {
        let header = format!("{}x{};{}\n", self.width, self.height, self.applied.join(","));
        let mut buf = BytesMut::with_capacity(header.len() + self.pixels.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.pixels);
        buf.freeze()
    }

    pub fn decode_encoded(data: &Bytes) -> Result<Self, DecodeError> {
        let malformed = |what: &str| DecodeError::Malformed(what.to_owned());

        let newline = data
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| malformed("missing header"))?;
        let header =
            std::str::from_utf8(&data[..newline]).map_err(|_| malformed("invalid header"))?;
        let (size, applied) = header
            .split_once(';')
            .ok_or_else(|| malformed("invalid header"))?;
        let (width, height) = size
            .split_once('x')
            .ok_or_else(|| malformed("invalid size"))?;

        Ok(Self {
            width: width.parse().map_err(|_| malformed("invalid width"))?,
            height: height.parse().map_err(|_| malformed("invalid height"))?,
            pixels: data.slice(newline + 1..),
            applied: applied
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
        })
    }
}

impl Resource for TestImage {
    fn size_bytes(&self) -> u64 {
        self.pixels.len() as u64
    }
}

/// Decodes and encodes [`TestImage`]s, counting how often it did so.
///
/// Source data that starts with `garbage` is rejected as malformed.
#[derive(Debug, Clone, Default)]
pub struct TestCodec {
    decodes: Arc<AtomicUsize>,
    encodes: Arc<AtomicUsize>,
}

impl TestCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }
}

impl ResourceDecoder<TestImage> for TestCodec {
    fn handles(&self, _resource_class: &ResourceClass) -> bool {
        true
    }

    fn decode(
        &self,
        data: &Bytes,
        width: u32,
        height: u32,
        options: &DecodeOptions,
    ) -> Result<Option<TestImage>, DecodeError> {
        self.decodes.fetch_add(1, Ordering::SeqCst);

        if options.transformed {
            return TestImage::decode_encoded(data).map(Some);
        }
        if data.starts_with(b"garbage") {
            return Err(DecodeError::Malformed("not an image".into()));
        }

        let size = Dimensions::new(width, height);
        let (width, height) = if size.is_original() {
            (data.len() as u32, 1)
        } else {
            (width, height)
        };
        Ok(Some(TestImage::new(width, height, data.clone())))
    }
}

impl ResourceEncoder<TestImage> for TestCodec {
    fn encode(&self, resource: &TestImage) -> Result<Bytes, DecodeError> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        Ok(resource.encode())
    }
}

/// A transformation that records its id in [`TestImage::applied`].
#[derive(Debug, Clone)]
pub struct Mark {
    id: TransformationId,
    fail: bool,
}

impl Mark {
    pub fn new(id: &str) -> Self {
        Self {
            id: TransformationId::new(id),
            fail: false,
        }
    }

    /// A transformation that always fails.
    pub fn failing(id: &str) -> Self {
        Self {
            id: TransformationId::new(id),
            fail: true,
        }
    }
}

impl Transformation<TestImage> for Mark {
    fn id(&self) -> &TransformationId {
        &self.id
    }

    fn transform(
        &self,
        mut resource: TestImage,
        _width: u32,
        _height: u32,
    ) -> Result<TestImage, DecodeError> {
        if self.fail {
            return Err(DecodeError::Transform {
                id: self.id.to_string(),
                details: "refusing to transform".into(),
            });
        }
        resource.applied.push(self.id.to_string());
        Ok(resource)
    }
}

#[derive(Debug)]
struct SourceInner {
    files: Mutex<HashMap<String, Result<Bytes, FetchError>>>,
    hits: Mutex<BTreeMap<String, usize>>,
    fetch_started: Notify,
    gate: Option<watch::Sender<bool>>,
    latency: Option<Duration>,
    cancellations: AtomicUsize,
    cleanups: AtomicUsize,
}

/// An in-memory source for `test://` keys.
///
/// Every fetch is counted per path. Paths without a file fail with [`FetchError::NotFound`].
#[derive(Debug, Clone)]
pub struct TestSource {
    inner: Arc<SourceInner>,
}

impl TestSource {
    pub const SCHEME: &'static str = "test";

    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A source whose fetches only complete once [`open_gate`](Self::open_gate) is called.
    pub fn gated() -> Self {
        Self::build(Some(watch::Sender::new(false)), None)
    }

    /// A source whose fetches take `latency` to complete.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(None, Some(latency))
    }

    fn build(gate: Option<watch::Sender<bool>>, latency: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                files: Mutex::new(HashMap::new()),
                hits: Mutex::new(BTreeMap::new()),
                fetch_started: Notify::new(),
                gate,
                latency,
                cancellations: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
            }),
        }
    }

    /// The source id for `path`.
    pub fn source_id(path: &str) -> SourceId {
        SourceId::new(format!("{}://{path}", Self::SCHEME))
    }

    /// A key for the original-size resource at `path`.
    pub fn key(path: &str) -> ResourceKey {
        ResourceKey::new(Self::source_id(path))
    }

    pub fn insert(&self, path: &str, data: impl Into<Bytes>) -> &Self {
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), Ok(data.into()));
        self
    }

    /// Makes fetches of `path` fail with [`FetchError::Failed`].
    pub fn fail(&self, path: &str, message: &str) -> &Self {
        self.inner
            .files
            .lock()
            .unwrap()
            .insert(path.to_owned(), Err(FetchError::Failed(message.to_owned())));
        self
    }

    /// Lets every pending and future fetch of a [`gated`](Self::gated) source complete.
    pub fn open_gate(&self) {
        if let Some(gate) = &self.inner.gate {
            gate.send_replace(true);
        }
    }

    /// The number of fetches started for `path`.
    pub fn fetches(&self, path: &str) -> usize {
        let hits = self.inner.hits.lock().unwrap();
        hits.get(path).copied().unwrap_or_default()
    }

    /// The number of fetches started for any path.
    pub fn total_fetches(&self) -> usize {
        self.inner.hits.lock().unwrap().values().sum()
    }

    /// Every path that was fetched, along with the number of fetches.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let hits = self.inner.hits.lock().unwrap();
        hits.iter().map(|(path, n)| (path.clone(), *n)).collect()
    }

    /// The number of fetchers that were told to cancel their fetch.
    pub fn cancellations(&self) -> usize {
        self.inner.cancellations.load(Ordering::SeqCst)
    }

    /// The number of fetchers that were cleaned up.
    pub fn cleanups(&self) -> usize {
        self.inner.cleanups.load(Ordering::SeqCst)
    }

    /// Waits until at least `count` fetches were started.
    pub async fn wait_for_fetches(&self, count: usize) {
        loop {
            let notified = self.inner.fetch_started.notified();
            if self.total_fetches() >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Default for TestSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DataFetcherFactory for TestSource {
    fn handles(&self, source: &SourceId) -> bool {
        source.scheme() == Some(Self::SCHEME)
    }

    fn build(&self, source: &SourceId, _size: Dimensions) -> Box<dyn DataFetcher> {
        let prefix = format!("{}://", Self::SCHEME);
        let path = source.as_str().trim_start_matches(&prefix).to_owned();
        Box::new(TestFetcher {
            inner: self.inner.clone(),
            path,
        })
    }
}

struct TestFetcher {
    inner: Arc<SourceInner>,
    path: String,
}

impl DataFetcher for TestFetcher {
    fn fetch(&mut self) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        let inner = self.inner.clone();
        let path = self.path.clone();
        async move {
            *inner.hits.lock().unwrap().entry(path.clone()).or_default() += 1;
            inner.fetch_started.notify_waiters();

            if let Some(latency) = inner.latency {
                tokio::time::sleep(latency).await;
            }
            if let Some(gate) = &inner.gate {
                let mut open = gate.subscribe();
                // the sender lives in `inner`, so this never fails
                let _ = open.wait_for(|open| *open).await;
            }

            let files = inner.files.lock().unwrap();
            files.get(&path).cloned().unwrap_or(Err(FetchError::NotFound))
        }
        .boxed()
    }

    fn cancel(&self) {
        self.inner.cancellations.fetch_add(1, Ordering::SeqCst);
    }

    fn cleanup(&mut self) {
        self.inner.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// An in-memory [`DiskCacheProvider`].
#[derive(Debug, Default)]
pub struct TestDiskCache {
    entries: Mutex<HashMap<DiskCacheKey, Bytes>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl TestDiskCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of entries in one tier.
    pub fn entries(&self, tier: DiskTier) -> usize {
        let entries = self.entries.lock().unwrap();
        entries.keys().filter(|key| key.tier() == tier).count()
    }

    pub fn get_entry(&self, key: &DiskCacheKey) -> Option<Bytes> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: DiskCacheKey, data: impl Into<Bytes>) {
        self.entries.lock().unwrap().insert(key, data.into());
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl DiskCacheProvider for TestDiskCache {
    fn get(&self, key: &DiskCacheKey) -> io::Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.get_entry(key))
    }

    fn put(
        &self,
        key: &DiskCacheKey,
        writer: &mut dyn FnMut(&mut dyn Write) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut buf = Vec::new();
        writer(&mut buf)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(key.clone(), buf);
        Ok(())
    }

    fn delete(&self, key: &DiskCacheKey) -> io::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

/// The result a load callback receives.
pub type LoadResult<T> = Result<ResourceHandle<T>, LoadError>;

/// Collects the results of load callbacks.
pub struct Collector<T> {
    results: Arc<Mutex<Vec<(usize, LoadResult<T>)>>>,
    notify: Arc<Notify>,
}

impl<T: Resource> Collector<T> {
    pub fn new() -> Self {
        Self {
            results: Arc::default(),
            notify: Arc::default(),
        }
    }

    /// A callback that records its result under `label`.
    pub fn callback(&self, label: usize) -> impl ResourceCallback<T> + use<T> {
        let results = self.results.clone();
        let notify = self.notify.clone();
        move |result: LoadResult<T>| {
            results.lock().unwrap().push((label, result));
            notify.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The labels of all results, in the order the callbacks were called.
    pub fn labels(&self) -> Vec<usize> {
        let results = self.results.lock().unwrap();
        results.iter().map(|(label, _)| *label).collect()
    }

    /// Removes and returns all results, in the order the callbacks were called.
    pub fn take(&self) -> Vec<LoadResult<T>> {
        let results = std::mem::take(&mut *self.results.lock().unwrap());
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Waits until at least `count` results arrived, then removes and returns all of them.
    pub async fn wait_for(&self, count: usize) -> Vec<LoadResult<T>> {
        loop {
            let notified = self.notify.notified();
            if self.len() >= count {
                return self.take();
            }
            notified.await;
        }
    }
}

impl<T: Resource> Default for Collector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Self {
            results: self.results.clone(),
            notify: self.notify.clone(),
        }
    }
}

/// A recycler that keeps the keys of everything it was handed.
#[derive(Debug, Default)]
pub struct TestRecycler {
    recycled: Mutex<Vec<ResourceKey>>,
}

impl TestRecycler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recycled(&self) -> Vec<ResourceKey> {
        self.recycled.lock().unwrap().clone()
    }
}

impl<T> ResourceRecycler<T> for TestRecycler {
    fn recycle(&self, key: ResourceKey, _resource: T) {
        self.recycled.lock().unwrap().push(key);
    }
}
