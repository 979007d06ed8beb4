use std::sync::Arc;
use std::time::Duration;

use glimmer_engine::caching::{DiskCacheKey, DiskCacheStrategy, DiskTier};
use glimmer_engine::{LoadOptions, ResourceKey};

use crate::{
    Collector, TestDiskCache, TestImage, TestSource, load, setup_engine, setup_engine_with_disk,
};

fn thumbnail(path: &str) -> ResourceKey {
    ResourceKey::builder(TestSource::source_id(path))
        .size(2, 2)
        .transform("grayscale")
        .build()
}

#[tokio::test]
async fn test_cold_load_falls_through_to_source() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let options = LoadOptions::default().disk_cache_strategy(DiskCacheStrategy::All);

    let handle = load(&harness.engine, thumbnail("cat.png"), options).await;
    assert_eq!((handle.width, handle.height), (2, 2));
    assert_eq!(handle.applied, ["grayscale"]);
    assert_eq!(harness.source.fetches("cat.png"), 1);

    // the source bytes and the transformed resource both went to disk
    assert_eq!(harness.disk.entries(DiskTier::Data), 1);
    assert_eq!(harness.disk.entries(DiskTier::Resource), 1);
    assert_eq!(harness.codec.encodes(), 1);
    let stored = harness
        .disk
        .get_entry(&DiskCacheKey::for_resource(&thumbnail("cat.png")))
        .unwrap();
    assert_eq!(stored, "2x2;grayscale\nmeow");
}

#[tokio::test]
async fn test_warm_disk_skips_the_source() {
    let disk = Arc::new(TestDiskCache::new());
    let options = LoadOptions::default().disk_cache_strategy(DiskCacheStrategy::All);

    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let first = setup_engine_with_disk(source, disk.clone(), |builder| builder);
    drop(load(&first.engine, thumbnail("cat.png"), options).await);

    // a fresh engine with empty memory tiers and a source that has nothing
    let second = setup_engine_with_disk(TestSource::new(), disk.clone(), |builder| builder);
    let handle = load(&second.engine, thumbnail("cat.png"), options).await;

    // served from the resource tier, without applying the transformation again
    assert_eq!(handle.applied, ["grayscale"]);
    assert_eq!(handle.pixels, "meow");
    assert_eq!(second.source.total_fetches(), 0);
    assert_eq!(second.codec.decodes(), 1);
}

#[tokio::test]
async fn test_data_tier_serves_other_variants() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);

    let small = ResourceKey::builder(TestSource::source_id("cat.png"))
        .size(2, 2)
        .build();
    let large = ResourceKey::builder(TestSource::source_id("cat.png"))
        .size(8, 8)
        .transform("blur")
        .build();

    let small = load(&harness.engine, small, LoadOptions::default()).await;
    let large = load(&harness.engine, large, LoadOptions::default()).await;
    assert_eq!((small.width, large.width), (2, 8));
    assert_eq!(large.applied, ["blur"]);

    assert_eq!(harness.source.fetches("cat.png"), 1);
    assert_eq!(harness.codec.decodes(), 2);
    // remote sources only get their data cached by default
    assert_eq!(harness.disk.entries(DiskTier::Data), 1);
    assert_eq!(harness.disk.entries(DiskTier::Resource), 0);
}

#[tokio::test]
async fn test_no_disk_cache_strategy() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let options = LoadOptions::default().disk_cache_strategy(DiskCacheStrategy::None);

    drop(load(&harness.engine, thumbnail("cat.png"), options).await);
    assert!(harness.disk.is_empty());
    assert_eq!(harness.disk.reads(), 0);
}

#[tokio::test]
async fn test_only_retrieve_from_cache() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);

    let collector = Collector::<TestImage>::new();
    harness.engine.load(
        thumbnail("cat.png"),
        LoadOptions::default().only_retrieve_from_cache(true),
        collector.callback(0),
    );
    let err = collector.wait_for(1).await.pop().unwrap().unwrap_err();

    insta::assert_snapshot!(err.to_string(), @r"
    failed to load resource, 2 causes
      1. resource cache: not found
      2. data cache: not found
    ");
    assert_eq!(harness.source.total_fetches(), 0);
}

#[tokio::test]
async fn test_corrupt_disk_entry_falls_through() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    harness
        .disk
        .insert(DiskCacheKey::for_resource(&thumbnail("cat.png")), "nonsense");

    let handle = load(&harness.engine, thumbnail("cat.png"), LoadOptions::default()).await;
    assert_eq!(handle.applied, ["grayscale"]);
    assert_eq!(harness.source.fetches("cat.png"), 1);
}

#[tokio::test]
async fn test_decode_failures() {
    let source = TestSource::new();
    source.insert("garbage.png", "garbage");
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);

    let broken = ResourceKey::builder(TestSource::source_id("cat.png"))
        .transform("grayscale")
        .transform("broken")
        .build();
    let unknown = ResourceKey::builder(TestSource::source_id("cat.png"))
        .transform("sepia")
        .build();

    let collector = Collector::<TestImage>::new();
    let options = LoadOptions::default().disk_cache_strategy(DiskCacheStrategy::None);
    harness
        .engine
        .load(TestSource::key("garbage.png"), options, collector.callback(0));
    harness.engine.load(broken, options, collector.callback(1));
    harness.engine.load(unknown, options, collector.callback(2));

    let mut results = collector.wait_for(3).await;
    results.sort_by_key(|result| result.as_ref().unwrap_err().to_string());
    let errors: Vec<_> = results
        .iter()
        .map(|result| {
            let err = result.as_ref().unwrap_err();
            err.no_result().unwrap().root_cause().unwrap().to_string()
        })
        .collect();

    insta::assert_debug_snapshot!(errors, @r#"
    [
        "source: malformed: not an image",
        "source: transformation `broken` failed: refusing to transform",
        "source: unknown transformation `sepia`",
    ]
    "#);
}

#[tokio::test(start_paused = true)]
async fn test_source_fetch_timeout() {
    let source = TestSource::with_latency(Duration::from_secs(60));
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| {
        builder.fetch_timeout(Some(Duration::from_secs(1)))
    });

    let collector = Collector::<TestImage>::new();
    harness.engine.load(
        TestSource::key("cat.png"),
        LoadOptions::default(),
        collector.callback(0),
    );
    let err = collector.wait_for(1).await.pop().unwrap().unwrap_err();
    let root_cause = err.no_result().unwrap().root_cause().unwrap();
    assert_eq!(root_cause.to_string(), "source: fetch timed out after 1s");
    assert_eq!(harness.source.cleanups(), 1);
}
