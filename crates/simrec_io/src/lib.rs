//! # simrec_io
//!
//! The I/O-performing half of the recording subsystem:
//!
//! - [`output_dir`]: leader-only creation of the run's output tree, with the
//!   outcome broadcast to every worker
//! - [`dataset`]: the per-entity fixed-length chunked dataset file
//! - [`recorder`]: block-buffered staging of samples and their flushes
//! - [`checkpoint`]: per-worker state files for deterministic resumption
//!
//! Every component takes its [`Worker`](simrec_core::Worker) or
//! [`Coordinator`](simrec_core::Coordinator) explicitly; there is no
//! process-wide rank state.

#![warn(missing_docs)]

pub mod checkpoint;
mod codec;
pub mod dataset;
pub mod output_dir;
pub mod recorder;

pub use checkpoint::{CheckpointError, CheckpointManager, CheckpointPhase, CheckpointRecord};
pub use dataset::{DatasetAttrs, DatasetError, DatasetReader, DatasetWriter};
pub use output_dir::{
    DirectoryState, OutputDirError, OutputDirectory, OutputDirectoryManager, OutputLayout,
};
pub use recorder::{BlockSchedule, RecorderError, RecordingPlan, TimeSeriesRecorder};
