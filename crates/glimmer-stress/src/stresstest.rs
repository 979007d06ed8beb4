use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use glimmer_engine::Engine;
use glimmer_engine::caching::FsDiskCache;
use glimmer_engine::config::Config;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{Counters, WorkloadsConfig, prepare_workloads, process_load};

#[derive(Default)]
struct WorkloadStats {
    durations: DDSketch,
    failures: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let counters = Arc::new(Counters::default());
    let (registry, workloads) = prepare_workloads(workloads, &counters);

    // without a configured cache dir, the disk tiers still get exercised in a temp directory
    let _cache_dir;
    let engine = match config.cache_dir {
        Some(_) => Engine::from_config(registry, &config)?,
        None => {
            let dir = tempfile::tempdir().context("failed to create temp cache dir")?;
            let disk = FsDiskCache::new(dir.path(), config.caches.disk)
                .context("failed to create disk cache")?;
            _cache_dir = dir;
            Engine::<Bytes>::builder(registry)
                .config(&config)
                .disk_cache(Arc::new(disk))
                .build()?
        }
    };

    let workloads: Vec<_> = workloads.into_iter().map(Arc::new).collect();

    // warmup: run each workload once to make sure the runtime and caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let engine = engine.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                let _ = process_load(&engine, workload.random_key()).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // the warmup is not part of the results
    let fetches_before = Counters::get(&counters.fetches);
    let failed_before = Counters::get(&counters.failed_fetches);
    let decodes_before = Counters::get(&counters.decodes);
    let transforms_before = Counters::get(&counters.transforms);

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let engine = engine.clone();
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency.max(1);
            let stats = Arc::new(Mutex::new(WorkloadStats::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let engine = engine.clone();
                        let stats = Arc::clone(&stats);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            let result = process_load(&engine, workload.random_key()).await;

                            let mut stats = stats.lock().unwrap();
                            stats.durations.add(task_start.elapsed().as_secs_f64());
                            if result.is_err() {
                                stats.failures += 1;
                            }
                            drop(stats);

                            // the handle is released here, moving the resource to the memory cache
                            drop(result);
                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let stats: WorkloadStats = {
                let mut stats = stats.lock().unwrap();
                std::mem::take(&mut stats)
            };
            (concurrency, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    let mut total_ops = 0;
    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, stats) = task.context("workload panicked")?;
        let durations = &stats.durations;

        let ops = durations.count();
        total_ops += ops;
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        println!("  failed loads: {}", stats.failures);
    }

    let fetches = Counters::get(&counters.fetches) - fetches_before;
    let failed = Counters::get(&counters.failed_fetches) - failed_before;
    let decodes = Counters::get(&counters.decodes) - decodes_before;
    let transforms = Counters::get(&counters.transforms) - transforms_before;
    println!();
    println!(
        "Engine: {total_ops} loads, {fetches} fetches ({failed} failed), {decodes} decodes, {transforms} transformations"
    );
    let stats = engine.stats();
    println!(
        "  memory: {} entries, {} / {} bytes; active: {}; jobs: {}",
        stats.memory_entries,
        stats.memory_size,
        stats.memory_max_size,
        stats.active_entries,
        stats.jobs,
    );

    engine.shutdown();

    Ok(())
}
