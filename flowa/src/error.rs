//! Error types for flowa
//!
//! Three layers, matching how far a failure is allowed to travel:
//! - [`ManagerError`]: anticipated per-station failures. Logged as warnings, the
//!   station is skipped, the event carries on.
//! - [`FlowError`]: what a station's flow returns. Either a categorized
//!   [`ManagerError`] or an uncategorized error that is counted separately.
//! - [`FlowaError`]: fatal setup errors that affect every station of a run.

use thiserror::Error;

/// Anticipated per-station workflow errors
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A required input (event, station metadata, observed or synthetic data)
    /// could not be obtained
    #[error("Gather error: {0}")]
    Gather(String),

    /// Preprocessing failed in an anticipated way
    #[error("Preprocess error: {0}")]
    Preprocess(String),

    /// Window selection failed in an anticipated way
    #[error("Window error: {0}")]
    Window(String),

    /// Misfit quantification failed in an anticipated way
    #[error("Quantify error: {0}")]
    Quantify(String),

    /// Window selection returned nothing, so there is nothing to measure
    #[error("No misfit windows for {0}, skipping misfit quantification")]
    NoWindows(String),

    /// A stage was requested before its precondition was met
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Outcome of running one station through the workflow
#[derive(Debug, Error)]
pub enum FlowError {
    /// Categorized, expected data problem
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// Anything the workflow taxonomy does not recognize
    #[error("Unexpected error: {0:#}")]
    Unexpected(anyhow::Error),
}

impl FlowError {
    /// True for errors outside the workflow taxonomy
    pub fn is_unexpected(&self) -> bool {
        matches!(self, FlowError::Unexpected(_))
    }
}

/// Fatal errors that abort the run
#[derive(Debug, Error)]
pub enum FlowaError {
    /// A path role required by the workflow has no template
    #[error("Path structure is missing required role '{0}'")]
    MissingPathRole(String),

    /// A file that must exist before processing does not
    #[error("Required file does not exist: {0}")]
    MissingFile(std::path::PathBuf),

    /// Fixed-window policy that is neither a boolean, ITER nor ONCE
    #[error("Invalid fix_windows policy '{0}', expected true, false, ITER or ONCE")]
    InvalidFixWindows(String),

    /// The event archive is held open by another process
    #[error("Archive {0} is already open in another process")]
    ArchiveBusy(std::path::PathBuf),

    /// Archive (SQLite) error
    #[error("Archive error: {0}")]
    Archive(#[from] sqlx::Error),

    /// Record (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input file (stations list, two-column trace, response document)
    #[error("Parse error: {0}")]
    Parse(String),

    /// A worker process could not be launched or reported garbage
    #[error("Worker error: {0}")]
    Worker(String),

    /// flowa-common error
    #[error("Common error: {0}")]
    Common(#[from] flowa_common::Error),
}

/// Convenience Result type using [`FlowaError`]
pub type Result<T> = std::result::Result<T, FlowaError>;
