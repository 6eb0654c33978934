use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::progress::Stage;

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum KeyError {
    #[error("missing value for {0}")]
    Missing(&'static str),

    #[error("invalid year: {0}")]
    InvalidYear(String),

    #[error("year {year} outside {min}..={max}")]
    YearOutOfRange { year: i32, min: i32, max: i32 },

    #[error("invalid region code: {0}")]
    InvalidRegion(String),

    #[error("invalid department code: {0}")]
    InvalidDepartment(String),

    #[error("invalid age band: {0}")]
    InvalidAgeBand(String),

    #[error("invalid sex code: {0}")]
    InvalidSex(String),

    #[error("invalid severity level: {0}")]
    InvalidSeverity(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file at {0}")]
    Read(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    Parse(String),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("download request failed: {0}")]
    Http(String),

    #[error("download returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("filesystem error during download: {0}")]
    Io(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum CleanError {
    #[error("unusable header in {path}: {reason}")]
    Header { path: PathBuf, reason: String },

    #[error("filesystem error while cleaning: {0}")]
    Io(String),

    #[error("CSV error while cleaning: {0}")]
    Csv(String),

    #[error("failed to write clean manifest: {0}")]
    Manifest(String),
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("sqlite error: {source}")]
    Sqlite {
        #[source]
        source: rusqlite::Error,
    },

    #[error("store filesystem error: {0}")]
    Filesystem(String),

    #[error("invalid table name: {0}")]
    InvalidTable(String),

    #[error("unknown label column: {0}")]
    InvalidColumn(String),
}

impl StoreError {
    pub fn is_disk_full(&self) -> bool {
        match self {
            StoreError::Sqlite { source } => matches!(
                source.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DiskFull)
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        StoreError::Sqlite { source }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("cleaned dataset at {0} is incomplete (no completion manifest)")]
    IncompleteInput(PathBuf),

    #[error("failed to read cleaned dataset: {0}")]
    Read(String),

    #[error("failed to create schema: {source}")]
    Schema {
        #[source]
        source: StoreError,
    },

    #[error("batch {batch} failed (last committed batch: {})", display_batch(.last_committed))]
    Batch {
        batch: u64,
        last_committed: Option<u64>,
        #[source]
        source: StoreError,
    },

    #[error("disk full while loading batch {batch}")]
    DiskFull { batch: u64 },

    #[error("row count mismatch after load: expected {expected}, found {found}")]
    CountMismatch { expected: u64, found: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LoadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Batch { .. })
    }
}

fn display_batch(batch: &Option<u64>) -> String {
    batch.map_or_else(|| "none".to_string(), |batch| batch.to_string())
}

#[derive(Debug, Error, Diagnostic)]
pub enum NormalizeError {
    #[error("label update failed on {column}: {source}")]
    Store {
        column: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Clean(#[from] CleanError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error("pipeline worker panicked")]
    WorkerPanicked,
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Config(_) | PipelineError::WorkerPanicked => Stage::NotStarted,
            PipelineError::Fetch(_) => Stage::Fetching,
            PipelineError::Clean(_) => Stage::Cleaning,
            PipelineError::Load(_) => Stage::Loading,
            PipelineError::Normalize(_) => Stage::Normalizing,
        }
    }
}
