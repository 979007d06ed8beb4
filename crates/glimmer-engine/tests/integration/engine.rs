use std::sync::Arc;
use std::time::Duration;

use glimmer_engine::engine::{CompletionQueue, Residency};
use glimmer_engine::{LoadError, LoadOptions, ResourceHandle, ResourceKey};

use crate::{Collector, TestImage, TestSource, load, setup_engine};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_decode_under_concurrency() {
    let source = TestSource::gated();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let engine = harness.engine.clone();

    let collector = Collector::<TestImage>::new();
    let loads: Vec<_> = (0..16)
        .map(|i| {
            let engine = engine.clone();
            let callback = collector.callback(i);
            tokio::spawn(async move {
                engine.load(
                    TestSource::key("cat.png"),
                    LoadOptions::default(),
                    callback,
                );
            })
        })
        .collect();
    for load in loads {
        load.await.unwrap();
    }

    harness.source.wait_for_fetches(1).await;
    harness.source.open_gate();

    let handles: Vec<_> = collector
        .wait_for(16)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(handles.len(), 16);
    assert!(handles.iter().all(|handle| handle.ptr_eq(&handles[0])));
    assert_eq!(handles[0].pixels, "meow");

    assert_eq!(harness.source.fetches("cat.png"), 1);
    assert_eq!(harness.codec.decodes(), 1);
    assert_eq!(
        engine.residency(&TestSource::key("cat.png")),
        Residency::Active(16)
    );
}

#[tokio::test]
async fn test_refcount_moves_between_tiers() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;
    let key = TestSource::key("cat.png");

    let first = load(engine, key.clone(), LoadOptions::default()).await;
    let second = first.clone();
    assert_eq!(first.acquired(), 2);
    assert_eq!(engine.residency(&key), Residency::Active(2));

    drop(first);
    assert_eq!(engine.residency(&key), Residency::Active(1));
    let stats = engine.stats();
    assert_eq!((stats.active_entries, stats.memory_entries), (1, 0));

    drop(second);
    assert_eq!(engine.residency(&key), Residency::Memory);
    let stats = engine.stats();
    assert_eq!((stats.active_entries, stats.memory_entries), (0, 1));
    assert_eq!(stats.memory_size, 4);
}

#[tokio::test]
async fn test_grace_window_reuse_without_fetch() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;
    let key = TestSource::key("cat.png");

    let handle = load(engine, key.clone(), LoadOptions::default()).await;
    drop(handle);
    assert_eq!(engine.residency(&key), Residency::Memory);

    let collector = Collector::new();
    let token = engine.load(key.clone(), LoadOptions::default(), collector.callback(0));
    // served before `load` returned
    assert!(token.is_noop());
    let handle = collector.take().pop().unwrap().unwrap();
    assert_eq!(handle.pixels, "meow");
    assert_eq!(engine.residency(&key), Residency::Active(1));

    assert_eq!(harness.source.fetches("cat.png"), 1);
    assert_eq!(harness.codec.decodes(), 1);
    assert!(harness.recycler.recycled().is_empty());
}

#[tokio::test]
async fn test_attach_before_complete() {
    let source = TestSource::gated();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;
    let key = TestSource::key("cat.png");

    let collector = Collector::<TestImage>::new();
    let first = engine.load(key.clone(), LoadOptions::default(), collector.callback(0));
    harness.source.wait_for_fetches(1).await;

    let second = engine.load(key.clone(), LoadOptions::default(), collector.callback(1));
    assert!(!first.is_noop());
    assert!(!second.is_noop());
    assert_eq!(engine.residency(&key), Residency::InFlight);
    assert_eq!(engine.stats().jobs, 1);

    harness.source.open_gate();
    let results = collector.wait_for(2).await;
    let a = results[0].as_ref().unwrap();
    let b = results[1].as_ref().unwrap();
    assert!(a.ptr_eq(b));
    assert_eq!(engine.residency(&key), Residency::Active(2));
    assert_eq!(engine.stats().jobs, 0);
    assert_eq!(harness.source.fetches("cat.png"), 1);
}

#[tokio::test]
async fn test_cancel_one_of_many() {
    let source = TestSource::gated();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;
    let key = TestSource::key("cat.png");

    let collector = Collector::<TestImage>::new();
    let tokens: Vec<_> = (0..3)
        .map(|i| engine.load(key.clone(), LoadOptions::default(), collector.callback(i)))
        .collect();
    harness.source.wait_for_fetches(1).await;

    tokens[1].cancel();
    // cancelling twice is harmless
    tokens[1].cancel();
    assert_eq!(engine.residency(&key), Residency::InFlight);

    harness.source.open_gate();
    let results = collector.wait_for(2).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(engine.residency(&key), Residency::Active(2));

    // the cancelled callback is never called, not even later
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(collector.is_empty());
    assert_eq!(harness.source.fetches("cat.png"), 1);
    assert_eq!(harness.source.cancellations(), 0);
}

#[tokio::test]
async fn test_cancel_all_cancels_decode() {
    let source = TestSource::gated();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;
    let key = TestSource::key("cat.png");

    let collector = Collector::<TestImage>::new();
    let a = engine.load(key.clone(), LoadOptions::default(), collector.callback(0));
    let b = engine.load(key.clone(), LoadOptions::default(), collector.callback(1));
    harness.source.wait_for_fetches(1).await;

    a.cancel();
    b.cancel();
    assert_eq!(engine.residency(&key), Residency::Absent);
    assert_eq!(engine.stats().jobs, 0);

    // the decode notices the cancellation while fetching and abandons the fetch
    while harness.source.cleanups() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(harness.source.cancellations(), 1);
    assert!(collector.is_empty());

    // nothing of the cancelled decode is left behind, the next load starts over
    harness.source.open_gate();
    let handle = load(engine, key.clone(), LoadOptions::default()).await;
    assert_eq!(handle.pixels, "meow");
    assert_eq!(harness.source.fetches("cat.png"), 2);
    assert!(collector.is_empty());
}

#[tokio::test]
async fn test_equal_keys_share_a_decode() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;

    let build = |transformations: &[&str]| {
        let mut builder = ResourceKey::builder(TestSource::source_id("cat.png")).size(4, 1);
        for id in transformations {
            builder = builder.transform(*id);
        }
        builder.build()
    };

    let first = load(engine, build(&["grayscale", "blur"]), LoadOptions::default()).await;
    let second = load(engine, build(&["grayscale", "blur"]), LoadOptions::default()).await;
    assert!(first.ptr_eq(&second));
    assert_eq!(harness.codec.decodes(), 1);

    // the order of transformations is part of the identity
    let reversed = load(engine, build(&["blur", "grayscale"]), LoadOptions::default()).await;
    assert!(!first.ptr_eq(&reversed));
    assert_eq!(first.applied, ["grayscale", "blur"]);
    assert_eq!(reversed.applied, ["blur", "grayscale"]);
    assert_eq!(harness.codec.decodes(), 2);

    // the second variant was decoded from the data tier
    assert_eq!(harness.source.fetches("cat.png"), 1);
}

#[tokio::test]
async fn test_source_failure_is_aggregated() {
    let source = TestSource::new();
    source.fail("cat.png", "connection reset");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;
    let key = TestSource::key("cat.png");

    let collector = Collector::<TestImage>::new();
    engine.load(key.clone(), LoadOptions::default(), collector.callback(0));
    engine.load(key.clone(), LoadOptions::default(), collector.callback(1));
    let results = collector.wait_for(2).await;

    let errors: Vec<_> = results.into_iter().map(Result::unwrap_err).collect();
    assert!(!errors[0].is_cancelled());
    // every callback receives the very same error
    assert_eq!(errors[0], errors[1]);
    insta::assert_snapshot!(errors[0].to_string(), @r"
    failed to load resource, 3 causes
      1. resource cache: not found
      2. data cache: not found
      3. source: fetch failed: connection reset
    ");

    assert_eq!(engine.residency(&key), Residency::Absent);
    let stats = engine.stats();
    assert_eq!((stats.memory_entries, stats.active_entries, stats.jobs), (0, 0, 0));
    assert!(harness.disk.is_empty());

    // failures are not remembered, the next load tries again
    engine.load(key.clone(), LoadOptions::default(), collector.callback(2));
    collector.wait_for(1).await;
    assert_eq!(harness.source.fetches("cat.png"), 2);
}

#[tokio::test]
async fn test_memory_eviction_recycles() {
    let source = TestSource::new();
    source.insert("a", "aaaaaaaa");
    source.insert("b", "bbbbbbbb");
    let harness = setup_engine(source, |builder| builder.memory_cache_size(10));
    let engine = &harness.engine;

    drop(load(engine, TestSource::key("a"), LoadOptions::default()).await);
    assert_eq!(engine.residency(&TestSource::key("a")), Residency::Memory);

    drop(load(engine, TestSource::key("b"), LoadOptions::default()).await);
    assert_eq!(engine.residency(&TestSource::key("a")), Residency::Absent);
    assert_eq!(engine.residency(&TestSource::key("b")), Residency::Memory);
    assert_eq!(harness.recycler.recycled(), [TestSource::key("a")]);

    engine.clear_memory();
    assert_eq!(
        harness.recycler.recycled(),
        [TestSource::key("a"), TestSource::key("b")]
    );
}

#[tokio::test]
async fn test_oversized_resource_is_recycled() {
    let source = TestSource::new();
    source.insert("big", "x".repeat(20));
    let harness = setup_engine(source, |builder| builder.memory_cache_size(10));
    let engine = &harness.engine;
    let key = TestSource::key("big");

    let handle = load(engine, key.clone(), LoadOptions::default()).await;
    assert_eq!(handle.size(), 20);
    drop(handle);

    assert_eq!(engine.residency(&key), Residency::Absent);
    assert_eq!(engine.stats().memory_size, 0);
    assert_eq!(harness.recycler.recycled(), [key]);
}

#[tokio::test]
async fn test_panicking_recycler_keeps_engine_usable() {
    let source = TestSource::new();
    source.insert("a", "aaaaaaaa");
    source.insert("b", "bbbbbbbb");
    let harness = setup_engine(source, |builder| {
        builder
            .memory_cache_size(10)
            .recycler(Arc::new(|key: ResourceKey, _: TestImage| {
                panic!("cannot recycle {key}")
            }))
    });
    let engine = &harness.engine;

    drop(load(engine, TestSource::key("a"), LoadOptions::default()).await);
    // evicts `a` into the recycler
    drop(load(engine, TestSource::key("b"), LoadOptions::default()).await);

    assert_eq!(engine.residency(&TestSource::key("a")), Residency::Absent);
    assert_eq!(engine.residency(&TestSource::key("b")), Residency::Memory);

    let handle = load(engine, TestSource::key("a"), LoadOptions::default()).await;
    assert_eq!(handle.pixels, "aaaaaaaa");
    assert_eq!(harness.source.fetches("a"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_and_release() {
    let source = TestSource::new();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| builder);
    let key = TestSource::key("cat.png");

    drop(load(&harness.engine, key.clone(), LoadOptions::default()).await);
    assert_eq!(harness.engine.residency(&key), Residency::Memory);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let engine = harness.engine.clone();
            let key = key.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..2_000 {
                    let (tx, rx) = std::sync::mpsc::channel();
                    engine.load(
                        key.clone(),
                        LoadOptions::default(),
                        move |result: Result<ResourceHandle<TestImage>, LoadError>| {
                            tx.send(result).ok();
                        },
                    );
                    let handle = rx.recv().unwrap().unwrap();
                    let clone = handle.clone();
                    assert!(clone.ptr_eq(&handle));
                    drop(handle);
                    drop(clone);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.await.unwrap();
    }

    // every acquire was matched by a release, and the key sits in exactly one tier
    assert_eq!(harness.engine.residency(&key), Residency::Memory);
    let stats = harness.engine.stats();
    assert_eq!((stats.active_entries, stats.memory_entries), (0, 1));
    assert_eq!(harness.source.fetches("cat.png"), 1);
    assert_eq!(harness.codec.decodes(), 1);
    assert!(harness.recycler.recycled().is_empty());
}

#[tokio::test]
async fn test_completion_queue_preserves_attach_order() {
    let queue = Arc::new(CompletionQueue::new());
    let source = TestSource::gated();
    source.insert("cat.png", "meow");
    let harness = setup_engine(source, |builder| {
        builder.completion_context(queue.clone())
    });
    let engine = &harness.engine;

    let collector = Collector::<TestImage>::new();
    for i in 0..5 {
        engine.load(
            TestSource::key("cat.png"),
            LoadOptions::default(),
            collector.callback(i),
        );
    }
    harness.source.open_gate();

    queue.ready().await;
    while queue.len() < 5 {
        tokio::task::yield_now().await;
    }
    // nothing runs until the owner of the queue drains it
    assert!(collector.is_empty());

    assert_eq!(queue.drain(), 5);
    assert_eq!(collector.labels(), [0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_shutdown_cancels_pending_loads() {
    let source = TestSource::gated();
    source.insert("cat.png", "meow");
    source.insert("dog.png", "woof");
    let harness = setup_engine(source, |builder| builder);
    let engine = &harness.engine;

    harness.source.open_gate();
    let kept = load(engine, TestSource::key("dog.png"), LoadOptions::default()).await;

    let collector = Collector::<TestImage>::new();
    engine.load(
        TestSource::key("cat.png"),
        LoadOptions::default(),
        collector.callback(0),
    );
    engine.shutdown();

    let results = collector.wait_for(1).await;
    assert!(results[0].as_ref().unwrap_err().is_cancelled());
    assert_eq!(engine.stats().jobs, 0);

    // handles outlive the shutdown
    assert_eq!(kept.pixels, "woof");
    drop(kept);
    assert_eq!(engine.stats().memory_entries, 0);
}
