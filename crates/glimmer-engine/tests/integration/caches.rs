use glimmer_engine::caching::{DiskCacheKey, DiskCacheStrategy, FsDiskCache};
use glimmer_engine::config::Config;
use glimmer_engine::{Engine, LoadOptions, ResourceKey};
use glimmer_test as test;

use crate::{TestCodec, TestSource, load, registry};

fn thumbnail() -> ResourceKey {
    ResourceKey::builder(TestSource::source_id("cat.png"))
        .size(2, 2)
        .transform("blur")
        .build()
}

#[tokio::test]
async fn test_engine_with_fs_disk_cache() {
    test::setup();
    let cache_dir = test::tempdir();
    let config = Config::from_reader(
        format!("cache_dir: {}\n", cache_dir.path().display()).as_bytes(),
    )
    .unwrap();
    let options = LoadOptions::default().disk_cache_strategy(DiskCacheStrategy::All);

    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let engine = Engine::from_config(registry(&source, &TestCodec::new()), &config).unwrap();
    let handle = load(&engine, thumbnail(), options).await;
    assert_eq!(handle.applied, ["blur"]);

    let disk = FsDiskCache::new(cache_dir.path(), config.caches.disk).unwrap();
    let resource_path = disk.path_for(&DiskCacheKey::for_resource(&thumbnail()));
    let data_path = disk.path_for(&DiskCacheKey::for_data(&thumbnail()));
    assert_eq!(std::fs::read(&data_path).unwrap(), b"meow");
    assert_eq!(
        std::fs::read(&resource_path).unwrap(),
        b"2x2;blur\nmeow".as_slice()
    );

    // another engine on the same directory never needs the source
    let empty = TestSource::new();
    let codec = TestCodec::new();
    let other = Engine::from_config(registry(&empty, &codec), &config).unwrap();
    let handle = load(&other, thumbnail(), options).await;
    assert_eq!(handle.applied, ["blur"]);
    assert_eq!(empty.total_fetches(), 0);
    assert_eq!(codec.decodes(), 1);

    // both entries were just used, so cleanup keeps them
    let stats = disk.cleanup(false).unwrap();
    assert_eq!(stats.removed_files, 0);
    assert_eq!(stats.retained_files, 2);
}

#[tokio::test]
async fn test_engine_without_cache_dir() {
    test::setup();
    let config = Config::from_reader("caches:\n  memory:\n    max_size: 3\n".as_bytes()).unwrap();

    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let engine = Engine::from_config(registry(&source, &TestCodec::new()), &config).unwrap();
    assert_eq!(engine.stats().memory_max_size, 3);

    // the resource does not fit into memory, so every load starts over
    drop(load(&engine, TestSource::key("cat.png"), LoadOptions::default()).await);
    assert_eq!(engine.stats().memory_entries, 0);
    drop(load(&engine, TestSource::key("cat.png"), LoadOptions::default()).await);
    assert_eq!(source.fetches("cat.png"), 2);
}
