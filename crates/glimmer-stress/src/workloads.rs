use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use glimmer_engine::pipeline::{
    DataFetcher, DataFetcherFactory, DecodeOptions, Registry, ResourceDecoder, ResourceEncoder,
    Transformation,
};
use glimmer_engine::{
    DecodeError, Dimensions, Engine, FetchError, LoadError, LoadOptions, ResourceClass,
    ResourceHandle, ResourceKey, SourceId, TransformationId,
};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of distinct sources this workload picks from.
    pub keys: usize,
    /// The target size of every load, the original size if missing.
    #[serde(default)]
    pub size: Option<(u32, u32)>,
    /// Transformation chains, every load picks one at random.
    #[serde(default = "default_transformations")]
    pub transformations: Vec<Vec<String>>,
    #[serde(default)]
    pub source: SimulatedSource,
}

fn default_transformations() -> Vec<Vec<String>> {
    vec![vec![]]
}

/// How the simulated remote source of a workload behaves.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatedSource {
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The probability of a single fetch failing.
    pub failure_rate: f64,
    pub resource_size: usize,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            failure_rate: 0.0,
            resource_size: 4096,
        }
    }
}

/// Counts what the engine did on behalf of all workloads.
#[derive(Debug, Default)]
pub struct Counters {
    pub fetches: AtomicUsize,
    pub failed_fetches: AtomicUsize,
    pub decodes: AtomicUsize,
    pub transforms: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

/// A workload with everything resolved that is needed to generate loads.
pub struct ParsedWorkload {
    pub index: usize,
    pub concurrency: usize,
    keys: usize,
    size: Dimensions,
    transformations: Vec<Vec<TransformationId>>,
}

impl ParsedWorkload {
    /// A random key out of the key space of this workload.
    pub fn random_key(&self) -> ResourceKey {
        let mut rng = rand::rng();
        let n = rng.random_range(0..self.keys.max(1));
        let chain = &self.transformations[rng.random_range(0..self.transformations.len())];

        let mut builder = ResourceKey::builder(SimulatedSources::source_id(self.index, n))
            .size(self.size.width, self.size.height);
        for id in chain {
            builder = builder.transform(id.clone());
        }
        builder.build()
    }
}

/// Creates the registry all workloads share, together with their parsed form.
pub fn prepare_workloads(
    workloads: WorkloadsConfig,
    counters: &Arc<Counters>,
) -> (Registry<Bytes>, Vec<ParsedWorkload>) {
    let mut transformation_ids = BTreeSet::new();
    let mut sources = Vec::with_capacity(workloads.workloads.len());

    let parsed = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(index, workload)| {
            let mut transformations: Vec<Vec<TransformationId>> = workload
                .transformations
                .iter()
                .map(|chain| chain.iter().map(|id| TransformationId::new(id.as_str())).collect())
                .collect();
            if transformations.is_empty() {
                transformations = vec![vec![]];
            }
            transformation_ids.extend(transformations.iter().flatten().cloned());
            sources.push(workload.source);

            let size = match workload.size {
                Some((width, height)) => Dimensions::new(width, height),
                None => Dimensions::ORIGINAL,
            };
            ParsedWorkload {
                index,
                concurrency: workload.concurrency,
                keys: workload.keys,
                size,
                transformations,
            }
        })
        .collect();

    let mut registry = Registry::new()
        .with_fetcher(SimulatedSources {
            sources: sources.into(),
            counters: counters.clone(),
        })
        .with_decoder(PassthroughCodec {
            counters: counters.clone(),
        })
        .with_encoder(PassthroughCodec {
            counters: counters.clone(),
        });
    for id in transformation_ids {
        registry = registry.with_transformation(Scramble {
            id,
            counters: counters.clone(),
        });
    }

    (registry, parsed)
}

/// Loads `key` and waits for the outcome.
pub async fn process_load(
    engine: &Engine<Bytes>,
    key: ResourceKey,
) -> Result<ResourceHandle<Bytes>, LoadError> {
    let (tx, rx) = oneshot::channel();
    engine.load(
        key,
        LoadOptions::default(),
        move |result: Result<ResourceHandle<Bytes>, LoadError>| {
            tx.send(result).ok();
        },
    );
    rx.await.unwrap_or(Err(LoadError::Cancelled))
}

/// Serves `stress://<workload>/<n>` with random bytes, slowly and sometimes not at all.
struct SimulatedSources {
    sources: Arc<[SimulatedSource]>,
    counters: Arc<Counters>,
}

impl SimulatedSources {
    const SCHEME: &'static str = "stress";

    fn source_id(workload: usize, n: usize) -> SourceId {
        SourceId::new(format!("{}://{workload}/{n}", Self::SCHEME))
    }

    fn workload(source: &SourceId) -> Option<usize> {
        let rest = source.as_str().strip_prefix("stress://")?;
        let (workload, _) = rest.split_once('/')?;
        workload.parse().ok()
    }
}

impl DataFetcherFactory for SimulatedSources {
    fn handles(&self, source: &SourceId) -> bool {
        source.scheme() == Some(Self::SCHEME)
    }

    fn build(&self, source: &SourceId, _size: Dimensions) -> Box<dyn DataFetcher> {
        let settings = Self::workload(source).and_then(|i| self.sources.get(i)).cloned();
        Box::new(SimulatedFetcher {
            settings,
            counters: self.counters.clone(),
        })
    }
}

struct SimulatedFetcher {
    settings: Option<SimulatedSource>,
    counters: Arc<Counters>,
}

impl DataFetcher for SimulatedFetcher {
    fn fetch(&mut self) -> BoxFuture<'_, Result<Bytes, FetchError>> {
        async move {
            let settings = self.settings.as_ref().ok_or(FetchError::NotFound)?;
            self.counters.fetches.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(settings.latency).await;

            let mut rng = rand::rng();
            if rng.random_bool(settings.failure_rate.clamp(0.0, 1.0)) {
                self.counters.failed_fetches.fetch_add(1, Ordering::Relaxed);
                return Err(FetchError::Failed("simulated failure".into()));
            }
            let mut data = vec![0; settings.resource_size];
            rng.fill(&mut data[..]);
            Ok(Bytes::from(data))
        }
        .boxed()
    }
}

/// "Decodes" by copying the bytes, so that decoding has a cost proportional to the size.
struct PassthroughCodec {
    counters: Arc<Counters>,
}

impl ResourceDecoder<Bytes> for PassthroughCodec {
    fn handles(&self, _resource_class: &ResourceClass) -> bool {
        true
    }

    fn decode(
        &self,
        data: &Bytes,
        _width: u32,
        _height: u32,
        _options: &DecodeOptions,
    ) -> Result<Option<Bytes>, DecodeError> {
        self.counters.decodes.fetch_add(1, Ordering::Relaxed);
        Ok(Some(Bytes::copy_from_slice(data)))
    }
}

impl ResourceEncoder<Bytes> for PassthroughCodec {
    fn encode(&self, resource: &Bytes) -> Result<Bytes, DecodeError> {
        Ok(resource.clone())
    }
}

/// Touches every byte, keyed by the transformation id.
struct Scramble {
    id: TransformationId,
    counters: Arc<Counters>,
}

impl Transformation<Bytes> for Scramble {
    fn id(&self) -> &TransformationId {
        &self.id
    }

    fn transform(&self, resource: Bytes, _width: u32, _height: u32) -> Result<Bytes, DecodeError> {
        self.counters.transforms.fetch_add(1, Ordering::Relaxed);
        let salt = self.id.as_str().bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        Ok(resource.iter().map(|b| b ^ salt).collect())
    }
}
