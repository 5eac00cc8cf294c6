// src/engine/batch.rs
//
// Batch orchestration: one independent pipeline run per file on the shared
// pool, bounded by a counting permit and a byte-weighted memory permit.
// The caller's thread dispatches; only admitted files are spawned.

use crate::engine::api::compress_with_encoder;
use crate::engine::common::run_with_panic_policy;
use crate::engine::decoder::probe;
use crate::engine::encoder::{NativeEncoder, RasterEncoder};
use crate::engine::io::SourceImage;
use crate::engine::memory::{self, WeightedSemaphore, MIN_ESTIMATE_BYTES};
use crate::engine::pool;
use crate::engine::report::CompressionReport;
use crate::error::{CompressError, Result};
use crate::ops::CompressionConfig;
use parking_lot::Mutex;
use rayon::{Scope, ThreadPool};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchOptions {
    /// Files in flight at once. 0 = number of CPUs; capped at `MAX_CONCURRENCY`
    pub concurrency: usize,
    /// Byte budget shared by in-flight files. `None` = container limit or fallback
    pub memory_budget: Option<u64>,
}

impl BatchOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}

/// Outcome of one file in a batch.
#[derive(Debug)]
pub struct BatchResult {
    /// Position of the file in the input slice
    pub index: usize,
    pub declared_name: String,
    pub outcome: Result<CompressionReport>,
}

impl BatchResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn report(&self) -> Option<&CompressionReport> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&CompressError> {
        self.outcome.as_ref().err()
    }
}

/// Compress every source with the native encoder. Results keep input order;
/// a failing file never affects its siblings.
pub fn compress_batch(
    sources: &[SourceImage],
    config: &CompressionConfig,
    options: &BatchOptions,
) -> Vec<BatchResult> {
    compress_batch_with_encoder(sources, config, options, &NativeEncoder::from_config(config))
}

pub fn compress_batch_with_encoder<E: RasterEncoder + ?Sized>(
    sources: &[SourceImage],
    config: &CompressionConfig,
    options: &BatchOptions,
    encoder: &E,
) -> Vec<BatchResult> {
    run_batch(pool::get_pool(), sources, config, options, encoder)
}

/// Permits are taken on the calling thread, before a job is spawned. A
/// spawned job never blocks on a permit, so a worker that steals sibling
/// jobs while its encoder waits on nested rayon work cannot wedge the batch.
fn run_batch<E: RasterEncoder + ?Sized>(
    thread_pool: Option<&ThreadPool>,
    sources: &[SourceImage],
    config: &CompressionConfig,
    options: &BatchOptions,
    encoder: &E,
) -> Vec<BatchResult> {
    let concurrency = pool::effective_concurrency(options.concurrency);
    let slots = Arc::new(WeightedSemaphore::new(concurrency as u64));
    let memory_budget = options
        .memory_budget
        .unwrap_or_else(memory::default_memory_budget);
    let bytes = Arc::new(WeightedSemaphore::new(memory_budget));

    tracing::debug!(
        files = sources.len(),
        concurrency,
        memory_budget,
        "starting batch"
    );

    let finished: Mutex<Vec<Option<BatchResult>>> =
        Mutex::new(std::iter::repeat_with(|| None).take(sources.len()).collect());

    match thread_pool {
        Some(pool) => pool.in_place_scope(|scope| {
            dispatch(scope, sources, config, encoder, &slots, &bytes, &finished)
        }),
        None => rayon::in_place_scope(|scope| {
            dispatch(scope, sources, config, encoder, &slots, &bytes, &finished)
        }),
    }

    let results: Vec<BatchResult> = finished.into_inner().into_iter().flatten().collect();
    let failed = results.iter().filter(|r| !r.is_ok()).count();
    tracing::info!(files = results.len(), failed, "batch finished");
    results
}

fn dispatch<'scope, E: RasterEncoder + ?Sized>(
    scope: &Scope<'scope>,
    sources: &'scope [SourceImage],
    config: &'scope CompressionConfig,
    encoder: &'scope E,
    slots: &Arc<WeightedSemaphore>,
    bytes: &Arc<WeightedSemaphore>,
    finished: &'scope Mutex<Vec<Option<BatchResult>>>,
) {
    for (index, source) in sources.iter().enumerate() {
        let slot = slots.acquire(1);
        let weight = probe(source)
            .map(|probed| memory::estimate_run_memory(&probed, config))
            .unwrap_or(MIN_ESTIMATE_BYTES);
        let reserved = bytes.acquire(weight);

        scope.spawn(move |_| {
            let result = process_one(index, source, config, encoder);
            drop((reserved, slot));
            finished.lock()[index] = Some(result);
        });
    }
}

fn process_one<E: RasterEncoder + ?Sized>(
    index: usize,
    source: &SourceImage,
    config: &CompressionConfig,
    encoder: &E,
) -> BatchResult {
    let outcome = run_with_panic_policy("batch", || compress_with_encoder(source, config, encoder));
    if let Err(err) = &outcome {
        tracing::warn!(
            index,
            name = source.declared_name(),
            code = err.category().code(),
            error = %err,
            "batch file failed"
        );
    }

    BatchResult {
        index,
        declared_name: source.declared_name().to_string(),
        outcome,
    }
}
