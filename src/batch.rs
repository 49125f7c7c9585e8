//! Parallel batch recognition over many photos.

use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::cache::{LoadReport, ReferenceCache};
use crate::config::{BatchConfig, PipelineConfig};
use crate::error::{RecognitionError, Result};
use crate::fingerprint::Fingerprinter;
use crate::metadata::CardCatalog;
use crate::pipeline::{as_secs, Recognition, Recognizer};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Recognized(Recognition),
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: ImageOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    /// In completion order, which varies between runs.
    pub results: Vec<ImageReport>,
    #[serde(rename = "total_time", serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub workers: usize,
}

impl BatchReport {
    /// Outcomes keyed by input path, independent of completion order.
    pub fn to_map(&self) -> BTreeMap<&Path, &ImageOutcome> {
        self.results
            .iter()
            .map(|r| (r.path.as_path(), &r.outcome))
            .collect()
    }

    pub fn get(&self, path: &Path) -> Option<&ImageOutcome> {
        self.results.iter().find(|r| r.path == path).map(|r| &r.outcome)
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, ImageOutcome::Failed { .. }))
            .count()
    }
}

/// Recognise every photo on a pool of `worker_count` threads. A failing
/// photo, including one that panics, becomes a `Failed` outcome and never
/// affects the others.
pub fn batch_recognize(paths: &[PathBuf], recognizer: &Recognizer, worker_count: usize) -> Result<BatchReport> {
    let started = Instant::now();
    let workers = worker_count.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("card-match-{i}"))
        .build()
        .map_err(|e| RecognitionError::WorkerPool(e.to_string()))?;

    tracing::info!(images = paths.len(), workers, "starting batch");
    let done = AtomicUsize::new(0);
    let total = paths.len();
    let (tx, rx) = mpsc::channel();
    pool.scope(|scope| {
        for path in paths {
            let tx = tx.clone();
            let done = &done;
            scope.spawn(move |_| {
                let outcome = recognize_guarded(recognizer, path);
                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                match &outcome {
                    ImageOutcome::Recognized(r) => tracing::debug!(
                        file = %path.display(),
                        finished,
                        total,
                        elapsed_ms = r.elapsed.as_millis() as u64,
                        "photo done"
                    ),
                    ImageOutcome::Failed { error } => tracing::warn!(
                        file = %path.display(),
                        finished,
                        total,
                        %error,
                        "photo failed"
                    ),
                }
                // receiver outlives the scope
                let _ = tx.send(ImageReport {
                    path: path.clone(),
                    outcome,
                });
            });
        }
    });
    drop(tx);

    let results: Vec<ImageReport> = rx.into_iter().collect();
    let report = BatchReport {
        results,
        elapsed: started.elapsed(),
        workers,
    };
    tracing::info!(
        images = report.results.len(),
        failures = report.failures(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "batch finished"
    );
    Ok(report)
}

fn recognize_guarded(recognizer: &Recognizer, path: &Path) -> ImageOutcome {
    match catch_unwind(AssertUnwindSafe(|| recognizer.recognize_path(path))) {
        Ok(Ok(recognition)) => ImageOutcome::Recognized(recognition),
        Ok(Err(e)) => ImageOutcome::Failed { error: e.to_string() },
        Err(panic) => ImageOutcome::Failed {
            error: format!("worker panicked: {}", panic_message(panic.as_ref())),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Load metadata and references for a run and build the recognizer.
pub fn prepare(batch: &BatchConfig, pipeline: &PipelineConfig) -> Result<(Recognizer, LoadReport)> {
    pipeline.validate()?;
    let catalog = CardCatalog::load_or_empty(batch.metadata_db.as_deref());
    let mut cache_config = pipeline.cache.clone();
    cache_config.enabled &= batch.use_cache;
    let cache = ReferenceCache::new(cache_config, Fingerprinter::new(pipeline.fingerprint.clone()));
    let (references, load_report) = cache.load(&batch.reference_root, &catalog)?;
    Ok((Recognizer::new(pipeline, Arc::new(references)), load_report))
}

/// Prepare references, then recognise `paths` with the configured worker count.
pub fn run(batch: &BatchConfig, pipeline: &PipelineConfig, paths: &[PathBuf]) -> Result<BatchReport> {
    let (recognizer, _) = prepare(batch, pipeline)?;
    batch_recognize(paths, &recognizer, batch.worker_count)
}
