//! Core functionality for incremental batch image analysis.
//!
//! This library provides the components of the analysis pipeline:
//! - Content fingerprinting and image discovery
//! - Record storage (JSON files or SQLite) with schema migration
//! - The task catalog and change detection
//! - Remote CLIP and LLM analyzers with retry and backoff

// -- External Dependencies --

use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;

// -- Standard Library --
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

// -- Internal Modules --
mod error;

// -- Public Re-exports --
pub use catalog::{catalog, AnalyzerCategory, TaskCatalog, TaskKey};
pub use config::*;
pub use detector::{ChangeDetector, PendingReason, PendingTasks};
pub use error::{Error, Result};
pub use executor::{RetryPolicy, TaskExecutor};
pub use export::ExportFormat;
pub use fingerprint::{fingerprint, fingerprint_bytes, ImageIdentity};
pub use record::{AnalysisRecord, ProcessingStatus, TaskResult, TaskStatus};
pub use summary::{BatchSummary, FileFailure};
pub use types::*;

// -- Public Modules --
pub mod analyzer;
pub mod catalog;
pub mod config;
pub mod detector;
pub mod discovery;
pub mod executor;
pub mod export;
pub mod fingerprint;
pub mod logging;
pub mod metadata;
pub mod persistence;
pub mod pipeline;
pub mod record;
pub mod summary;
pub mod types;

use logging::log_file_error;
use persistence::{PersistenceError, RecordStore};
use pipeline::{FileError, FileOutcome, FileProcessor, IdentityLocks};

/// Main entry point for the analysis process
pub struct Orchestrator {
    config: Config,
    store: Box<dyn RecordStore>,
    executor: TaskExecutor,
    catalog: TaskCatalog,
    detector: ChangeDetector,
    shutdown_requested: Arc<AtomicBool>,
    show_progress: bool,
}

impl Orchestrator {
    /// Validate the configuration and derive the task catalog
    pub fn new(config: Config, store: Box<dyn RecordStore>, executor: TaskExecutor) -> Result<Self> {
        config.validate()?;
        let catalog = catalog::catalog(&config)?;
        let detector = ChangeDetector::from_config(&config);

        info!("Task catalog has {} entries", catalog.len());

        // Interrupts also cut short any retry wait in progress
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let executor = executor.with_shutdown(shutdown_requested.clone());

        Ok(Self {
            config,
            store,
            executor,
            catalog,
            detector,
            shutdown_requested,
            show_progress: false,
        })
    }

    /// Open the configured store and build the HTTP analyzers
    pub fn from_config(config: Config) -> Result<Self> {
        let store = persistence::open_store(&config)?;
        let executor = TaskExecutor::from_config(&config)?;
        Self::new(config, store, executor)
    }

    /// Draw a progress bar on stderr while processing
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    /// Flag that stops new files from being started once set
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown_requested.clone()
    }

    /// Discover all images below `root`
    pub fn discover_images(&self, root: &Path) -> Result<Vec<ImageFile>> {
        discovery::discover_images(root, &self.config)
    }

    /// Run the full pipeline over a directory tree
    pub fn run(&self, root: &Path, force: bool) -> Result<BatchSummary> {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        info!("Discovering images in {}", root.display());
        let images = self.discover_images(root)?;
        info!("Found {} images", images.len());

        self.process_images(&images, force || self.config.processing.force_reprocess)
    }

    /// Process an explicit list of files
    pub fn process_images(&self, image_files: &[ImageFile], force: bool) -> Result<BatchSummary> {
        let start_time = Instant::now();
        let locks = IdentityLocks::new();
        let processor = FileProcessor {
            store: self.store.as_ref(),
            executor: &self.executor,
            catalog: &self.catalog,
            detector: self.detector,
            locks: &locks,
            extract_metadata: self.config.processing.enable_metadata_extraction,
        };

        let progress_bar = if self.show_progress {
            let bar = ProgressBar::new(image_files.len() as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{eta}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("##-"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };

        let counters = BatchCounters::default();
        let max_storage_failures = self.config.processing.max_consecutive_storage_failures;

        let handle = |image: &ImageFile| {
            if self.shutdown_requested.load(Ordering::SeqCst) || counters.aborted() {
                counters.cancelled.fetch_add(1, Ordering::Relaxed);
                progress_bar.inc(1);
                return;
            }

            counters.record(&image.path, processor.process(image, force), max_storage_failures);
            progress_bar.set_message(counters.progress_message());
            progress_bar.inc(1);
        };

        if self.config.processing.parallel {
            let num_threads = self.config.worker_threads();
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(num_threads)
                .build()
                .map_err(|e| Error::Configuration(format!("Failed to build thread pool: {}", e)))?;
            info!("Processing {} images on {} threads", image_files.len(), num_threads);
            pool.install(|| image_files.par_iter().for_each(handle));
        } else {
            image_files.iter().for_each(handle);
        }

        progress_bar.finish_with_message(format!(
            "Completed in {:.1}s: {}",
            start_time.elapsed().as_secs_f64(),
            counters.progress_message()
        ));

        if let Some(reason) = counters.take_abort_reason() {
            error!("Batch aborted: {}", reason);
            return Err(Error::Storage(reason));
        }

        let summary = counters.into_summary(image_files.len());

        if self.config.processing.generate_summaries && summary.processed + summary.failed > 0 {
            self.write_summaries();
        }

        info!("Batch finished: {}", summary);
        Ok(summary)
    }

    fn write_summaries(&self) {
        let records = match self.store.list() {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not list records for summaries: {}", e);
                return;
            }
        };
        match summary::write_summaries(&records, &self.config.store.output_directory) {
            Ok(paths) => {
                for path in paths {
                    info!("Wrote summary {}", path.display());
                }
            }
            Err(e) => warn!("Failed to write summaries: {}", e),
        }
    }
}

/// Thread-safe tallies for one batch
#[derive(Default)]
struct BatchCounters {
    processed: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    cancelled: AtomicUsize,
    tasks_run: AtomicUsize,
    tasks_failed: AtomicUsize,
    consecutive_storage_failures: AtomicUsize,
    failures: Mutex<Vec<FileFailure>>,
    abort: AtomicBool,
    abort_reason: Mutex<Option<String>>,
}

impl BatchCounters {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn record(
        &self,
        path: &Path,
        outcome: std::result::Result<FileOutcome, FileError>,
        max_storage_failures: usize,
    ) {
        match outcome {
            Ok(FileOutcome::Skipped) => {
                self.consecutive_storage_failures.store(0, Ordering::SeqCst);
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(FileOutcome::Processed {
                tasks_run,
                tasks_failed,
            }) => {
                self.consecutive_storage_failures.store(0, Ordering::SeqCst);
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.add_tasks(tasks_run, tasks_failed);
            }
            Ok(FileOutcome::Failed {
                message,
                tasks_run,
                tasks_failed,
            }) => {
                self.consecutive_storage_failures.store(0, Ordering::SeqCst);
                self.add_tasks(tasks_run, tasks_failed);
                self.fail(path, message);
            }
            Err(FileError::Read(e)) => {
                log_file_error(path, "read image", &e);
                self.fail(path, e.to_string());
            }
            Err(FileError::Storage(e)) => {
                log_file_error(path, "access record", &e);
                // Unreadable documents are a per-file problem, not a failing store
                let streak = match e {
                    PersistenceError::Serialization(_) | PersistenceError::UnsupportedSchema(_) => 0,
                    _ => self.consecutive_storage_failures.fetch_add(1, Ordering::SeqCst) + 1,
                };
                if e.is_fatal() || streak >= max_storage_failures {
                    self.request_abort(format!("{} (after {} consecutive storage failures)", e, streak));
                }
                self.fail(path, format!("Storage error: {}", e));
            }
        }
    }

    fn add_tasks(&self, run: usize, failed: usize) {
        self.tasks_run.fetch_add(run, Ordering::Relaxed);
        self.tasks_failed.fetch_add(failed, Ordering::Relaxed);
    }

    fn fail(&self, path: &Path, message: String) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(FileFailure {
                path: path.to_path_buf(),
                message,
            });
    }

    fn request_abort(&self, reason: String) {
        let mut slot = self.abort_reason.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    fn take_abort_reason(&self) -> Option<String> {
        self.abort_reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    fn progress_message(&self) -> String {
        format!(
            "{} processed, {} skipped, {} failed",
            self.processed.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed)
        )
    }

    fn into_summary(self, discovered: usize) -> BatchSummary {
        let mut failures = self
            .failures
            .into_inner()
            .unwrap_or_else(|p| p.into_inner());
        failures.sort_by(|a, b| a.path.cmp(&b.path));

        BatchSummary {
            discovered,
            processed: self.processed.into_inner(),
            skipped: self.skipped.into_inner(),
            failed: self.failed.into_inner(),
            cancelled: self.cancelled.into_inner(),
            tasks_run: self.tasks_run.into_inner(),
            tasks_failed: self.tasks_failed.into_inner(),
            failures,
        }
    }
}
