use std::sync::Arc;

use glimmer_engine::engine::EngineBuilder;
use glimmer_engine::pipeline::Registry;
use glimmer_engine::{Engine, LoadOptions, ResourceHandle, ResourceKey};
use glimmer_test as test;

pub use test::{Collector, Mark, TestCodec, TestDiskCache, TestImage, TestRecycler, TestSource};

/// Everything a test needs to drive an engine and observe its collaborators.
pub struct Harness {
    pub engine: Engine<TestImage>,
    pub source: TestSource,
    pub codec: TestCodec,
    pub disk: Arc<TestDiskCache>,
    pub recycler: Arc<TestRecycler>,
}

/// The registry every test engine uses: the given source, the [`TestCodec`], and the
/// `grayscale`, `blur` and (failing) `broken` transformations.
pub fn registry(source: &TestSource, codec: &TestCodec) -> Registry<TestImage> {
    Registry::new()
        .with_fetcher(source.clone())
        .with_decoder(codec.clone())
        .with_encoder(codec.clone())
        .with_transformation(Mark::new("grayscale"))
        .with_transformation(Mark::new("blur"))
        .with_transformation(Mark::failing("broken"))
}

/// Setup tests and create a test engine reading from `source`.
///
/// The engine runs its decodes on a small worker pool on the current runtime and calls
/// callbacks inline. The `update` closure can change any of that before the engine is built.
pub fn setup_engine(
    source: TestSource,
    update: impl FnOnce(EngineBuilder<TestImage>) -> EngineBuilder<TestImage>,
) -> Harness {
    setup_engine_with_disk(source, Arc::new(TestDiskCache::new()), update)
}

/// Like [`setup_engine`], but with a disk cache that may be shared with other engines.
pub fn setup_engine_with_disk(
    source: TestSource,
    disk: Arc<TestDiskCache>,
    update: impl FnOnce(EngineBuilder<TestImage>) -> EngineBuilder<TestImage>,
) -> Harness {
    test::setup();

    let codec = TestCodec::new();
    let recycler = Arc::new(TestRecycler::new());
    let builder = Engine::builder(registry(&source, &codec))
        .memory_cache_size(1024)
        .max_concurrent_decodes(4)
        .disk_cache(disk.clone())
        .recycler(recycler.clone());
    let engine = update(builder).build().unwrap();

    Harness {
        engine,
        source,
        codec,
        disk,
        recycler,
    }
}

/// Loads `key` and waits for the result.
pub async fn load(
    engine: &Engine<TestImage>,
    key: ResourceKey,
    options: LoadOptions,
) -> ResourceHandle<TestImage> {
    let collector = Collector::new();
    engine.load(key, options, collector.callback(0));
    collector.wait_for(1).await.pop().unwrap().unwrap()
}
