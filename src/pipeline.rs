use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{error, info};

use crate::clean::{CleanOptions, CleanedDataset, clean};
use crate::config::ResolvedConfig;
use crate::error::{LoadError, PipelineError};
use crate::fetch::{DatasetSource, RawDataset, ensure_raw_dataset};
use crate::layout::non_empty_file;
use crate::load::{LoadOptions, LoadReport, load};
use crate::normalize::{NormalizeOptions, NormalizeReport, normalize_labels};
use crate::progress::{ProgressTracker, Stage};
use crate::store::{EffectifsStore, SqliteStore};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub force: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: u64,
    pub fetch: RawDataset,
    pub clean: CleanedDataset,
    pub load: LoadReport,
    pub normalize: NormalizeReport,
    pub rows: u64,
}

pub struct Pipeline<S: DatasetSource> {
    config: ResolvedConfig,
    source: Arc<S>,
    tracker: Arc<ProgressTracker>,
}

impl<S: DatasetSource> Clone for Pipeline<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            source: Arc::clone(&self.source),
            tracker: Arc::clone(&self.tracker),
        }
    }
}

impl<S: DatasetSource> Pipeline<S> {
    pub fn new(config: ResolvedConfig, source: S, tracker: Arc<ProgressTracker>) -> Self {
        Self {
            config,
            source: Arc::new(source),
            tracker,
        }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Runs all four stages in order. The tracker ends in `Done` or `Failed`.
    pub fn run(&self, options: RunOptions) -> Result<PipelineReport, PipelineError> {
        self.tracker.set_mirror(self.config.progress_file.clone());
        let run_id = self.tracker.restart();
        info!(run_id, force = options.force, "initialization started");

        match self.run_stages(run_id, options) {
            Ok(report) => {
                self.tracker
                    .complete(format!("store ready with {} rows", report.rows));
                info!(run_id, rows = report.rows, "initialization finished");
                Ok(report)
            }
            Err(err) => {
                error!(run_id, stage = %err.stage(), error = %err, "initialization failed");
                self.tracker.fail(err.stage(), err.to_string());
                Err(err)
            }
        }
    }

    fn run_stages(&self, run_id: u64, options: RunOptions) -> Result<PipelineReport, PipelineError> {
        let layout = &self.config.layout;
        let tracker = self.tracker.as_ref();

        tracker.enter(Stage::Fetching, "fetching raw dataset");
        let fetch = ensure_raw_dataset(
            layout.raw_path(),
            &self.config.source_url,
            options.force,
            self.source.as_ref(),
            tracker,
        )?;

        tracker.enter(Stage::Cleaning, "cleaning raw dataset");
        let clean_options = CleanOptions {
            chunk_rows: self.config.chunk_rows,
            years: self.config.years,
            decode_fallback: self.config.decode_fallback,
            force: options.force,
        };
        let clean = clean(layout.raw_path(), layout.clean_path(), &clean_options, tracker)?;

        tracker.enter(Stage::Loading, "loading store");
        let mut store = SqliteStore::open(layout.store_path(), &self.config.table_name)
            .map_err(LoadError::from)?;
        let load = load(
            layout.clean_path(),
            &mut store,
            LoadOptions {
                batch_size: self.config.batch_size,
                force: options.force,
            },
            tracker,
        )?;

        tracker.enter(Stage::Normalizing, "normalizing pathology labels");
        let normalize = normalize_labels(
            &mut store,
            NormalizeOptions {
                batch_size: self.config.batch_size,
                dry_run: false,
            },
            tracker,
        )?;
        let rows = store.row_count().map_err(LoadError::from)?;

        Ok(PipelineReport {
            run_id,
            fetch,
            clean,
            load,
            normalize,
            rows,
        })
    }

    /// True when the raw file, the store or its rows are missing.
    pub fn needs_initialization(&self) -> bool {
        let layout = &self.config.layout;
        if !non_empty_file(layout.raw_path()) || !layout.store_path().as_std_path().is_file() {
            return true;
        }
        let Ok(store) = SqliteStore::open_read_only(layout.store_path(), &self.config.table_name)
        else {
            return true;
        };
        let loaded = matches!(store.row_count(), Ok(rows) if rows > 0);
        let completed = matches!(store.checkpoint(), Ok(Some(checkpoint)) if checkpoint.completed);
        !(loaded && completed)
    }
}

impl<S: DatasetSource + 'static> Pipeline<S> {
    /// Runs the pipeline on a worker thread; poll `handle.tracker()` meanwhile.
    pub fn spawn(&self, options: RunOptions) -> PipelineHandle {
        let pipeline = self.clone();
        let worker = thread::spawn(move || pipeline.run(options));
        PipelineHandle {
            tracker: Arc::clone(&self.tracker),
            worker,
        }
    }
}

pub struct PipelineHandle {
    tracker: Arc<ProgressTracker>,
    worker: JoinHandle<Result<PipelineReport, PipelineError>>,
}

impl PipelineHandle {
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn join(self) -> Result<PipelineReport, PipelineError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(_) => {
                let stage = self.tracker.snapshot().stage;
                self.tracker.fail(stage, "pipeline worker panicked");
                Err(PipelineError::WorkerPanicked)
            }
        }
    }
}
