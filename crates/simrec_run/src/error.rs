//! Error types for a recorded run.

use std::path::PathBuf;
use thiserror::Error;

/// Run error type
#[derive(Debug, Error)]
pub enum RunError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Output directory error
    #[error("Output directory error: {0}")]
    OutputDir(#[from] simrec_io::OutputDirError),

    /// Recording error
    #[error("Recording error: {0}")]
    Recorder(#[from] simrec_io::RecorderError),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] simrec_io::CheckpointError),

    /// Group coordination error
    #[error("Coordination error: {0}")]
    Coordinator(#[from] simrec_core::CoordinatorError),

    /// Reference engine error
    #[error("Engine error: {0}")]
    Engine(#[from] crate::engine::EngineError),

    /// Log file could not be opened
    #[error("Cannot open log file {path}: {source}")]
    LogFile {
        /// Log file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked
    #[error("Worker {rank} panicked")]
    WorkerPanicked {
        /// Rank of the worker
        rank: usize,
    },
}

/// Result type for run operations.
pub type RunResult<T> = Result<T, RunError>;
