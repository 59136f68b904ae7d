//! Checkpoint manager orchestrating save, load and restore.

use super::state::{CheckpointRecord, STATE_FILE_PREFIX};
use simrec_core::{StateCapturable, Worker};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info};

/// Errors that can occur during checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Live stream count differs from the saved one.
    #[error("Stream count mismatch: checkpoint has {saved}, engine enumerates {live}")]
    StateMismatch {
        /// Streams in the checkpoint
        saved: usize,
        /// Streams in the live engine
        live: usize,
    },

    /// State file could not be read or written.
    #[error("Checkpoint I/O error on {path}: {source}")]
    Io {
        /// State file path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// State file is malformed.
    #[error("Invalid checkpoint: {0}")]
    Format(String),

    /// State file was written by another worker.
    #[error("Checkpoint belongs to rank {found}, expected rank {expected}")]
    RankMismatch {
        /// Rank of the loading worker
        expected: usize,
        /// Rank recorded in the file
        found: usize,
    },

    /// Engine failed to capture or apply its state.
    #[error("Engine state error: {0}")]
    Engine(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Operation not allowed in the current phase.
    #[error("Checkpoint operation not allowed in phase {phase:?}")]
    InvalidPhase {
        /// Phase at the time of the call
        phase: CheckpointPhase,
    },
}

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Per-worker checkpoint phase.
///
/// ```text
/// Running ──▶ Saving ────▶ Running
///    └──────▶ Restoring ─▶ Running
///                 └──────▶ Failed
/// ```
///
/// `Failed` is terminal: every later save or restore is refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointPhase {
    /// Between checkpoint operations.
    Running,
    /// Capturing and persisting state.
    Saving,
    /// Applying a loaded record.
    Restoring,
    /// A save or restore failed.
    Failed,
}

/// Saves and restores one worker's checkpoint.
#[derive(Debug)]
pub struct CheckpointManager {
    state_dir: PathBuf,
    phase: CheckpointPhase,
}

impl CheckpointManager {
    /// Creates a manager keeping its files in `state_dir`.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            phase: CheckpointPhase::Running,
        }
    }

    /// Current phase.
    #[inline]
    pub fn phase(&self) -> CheckpointPhase {
        self.phase
    }

    /// Directory holding the state files.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// State file of `worker`.
    pub fn state_file(&self, worker: &Worker) -> PathBuf {
        self.state_dir
            .join(format!("{}{}", STATE_FILE_PREFIX, worker.rank()))
    }

    /// Captures the engine's state and stream positions and persists them.
    ///
    /// The file is replaced atomically; the previous checkpoint survives a
    /// failed save on disk, but the manager enters
    /// [`CheckpointPhase::Failed`].
    pub fn save<E>(&mut self, worker: &Worker, engine: &E) -> CheckpointResult<CheckpointRecord>
    where
        E: StateCapturable + ?Sized,
    {
        self.enter(CheckpointPhase::Saving)?;
        let result = self.save_inner(worker, engine);
        self.leave(worker, &result);
        result
    }

    /// Reads `worker`'s state file back.
    ///
    /// # Errors
    ///
    /// - [`CheckpointError::Io`] if the file cannot be read
    /// - [`CheckpointError::Format`] if it is malformed
    /// - [`CheckpointError::RankMismatch`] if another rank wrote it
    pub fn load(&self, worker: &Worker) -> CheckpointResult<CheckpointRecord> {
        let path = self.state_file(worker);
        let bytes = fs::read(&path).map_err(io_error(&path))?;
        let (rank, record) = CheckpointRecord::decode(&bytes)?;
        if rank != worker.rank() {
            return Err(CheckpointError::RankMismatch {
                expected: worker.rank(),
                found: rank,
            });
        }
        Ok(record)
    }

    /// Applies `record` to `engine`.
    ///
    /// The live stream count is checked first; on a mismatch the engine is
    /// left untouched. Otherwise the state blob is applied, then the i-th
    /// saved position to the i-th stream.
    pub fn restore<E>(
        &mut self,
        worker: &Worker,
        engine: &mut E,
        record: &CheckpointRecord,
    ) -> CheckpointResult<()>
    where
        E: StateCapturable + ?Sized,
    {
        self.enter(CheckpointPhase::Restoring)?;
        let result = Self::restore_inner(engine, record);
        self.leave(worker, &result);
        result
    }

    fn save_inner<E>(&self, worker: &Worker, engine: &E) -> CheckpointResult<CheckpointRecord>
    where
        E: StateCapturable + ?Sized,
    {
        let blob = engine
            .capture_state()
            .map_err(|err| CheckpointError::Engine(Box::new(err)))?;
        let record = CheckpointRecord::new(blob, engine.stream_positions());
        let bytes = record.encode(worker.rank())?;

        fs::create_dir_all(&self.state_dir).map_err(io_error(&self.state_dir))?;
        let path = self.state_file(worker);
        write_atomic(&path, &bytes)?;

        info!(
            rank = worker.rank(),
            path = %path.display(),
            streams = record.stream_count(),
            blob_bytes = record.state_blob.len(),
            "Checkpoint saved"
        );
        Ok(record)
    }

    fn restore_inner<E>(engine: &mut E, record: &CheckpointRecord) -> CheckpointResult<()>
    where
        E: StateCapturable + ?Sized,
    {
        let live = engine.stream_count();
        if live != record.stream_count() {
            return Err(CheckpointError::StateMismatch {
                saved: record.stream_count(),
                live,
            });
        }
        engine
            .apply_state(&record.state_blob)
            .map_err(|err| CheckpointError::Engine(Box::new(err)))?;
        engine.set_stream_positions(&record.rng_sequence);
        Ok(())
    }

    fn enter(&mut self, phase: CheckpointPhase) -> CheckpointResult<()> {
        if self.phase != CheckpointPhase::Running {
            return Err(CheckpointError::InvalidPhase { phase: self.phase });
        }
        self.phase = phase;
        Ok(())
    }

    fn leave<T>(&mut self, worker: &Worker, result: &CheckpointResult<T>) {
        let from = self.phase;
        self.phase = match result {
            Ok(_) => CheckpointPhase::Running,
            Err(err) => {
                error!(rank = worker.rank(), phase = ?from, error = %err, "Checkpoint operation failed");
                CheckpointPhase::Failed
            }
        };
        if from == CheckpointPhase::Restoring && result.is_ok() {
            info!(rank = worker.rank(), "Checkpoint restored");
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CheckpointResult<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp).map_err(io_error(&tmp))?;
    file.write_all(bytes).map_err(io_error(&tmp))?;
    file.sync_all().map_err(io_error(&tmp))?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_error(path))
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrec_core::StreamPosition;
    use std::fmt;
    use tempfile::tempdir;

    // =========================================================================
    // Test engine
    // =========================================================================

    #[derive(Debug)]
    struct BadBlob;

    impl fmt::Display for BadBlob {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "bad blob")
        }
    }

    impl std::error::Error for BadBlob {}

    #[derive(Default)]
    struct Counters {
        blob: Vec<u8>,
        positions: Vec<StreamPosition>,
    }

    impl StateCapturable for Counters {
        type Error = BadBlob;

        fn capture_state(&self) -> Result<Vec<u8>, BadBlob> {
            Ok(self.blob.clone())
        }

        fn apply_state(&mut self, blob: &[u8]) -> Result<(), BadBlob> {
            if blob == b"corrupt" {
                return Err(BadBlob);
            }
            self.blob = blob.to_vec();
            Ok(())
        }

        fn stream_positions(&self) -> Vec<StreamPosition> {
            self.positions.clone()
        }

        fn set_stream_positions(&mut self, positions: &[StreamPosition]) {
            self.positions = positions.to_vec();
        }
    }

    // =========================================================================
    // Save / load / restore
    // =========================================================================

    #[test]
    fn test_save_writes_rank_keyed_file() {
        let dir = tempdir().unwrap();
        let worker = Worker::new(2, 4).unwrap();
        let engine = Counters {
            blob: b"abc".to_vec(),
            positions: vec![10, 20],
        };
        let mut manager = CheckpointManager::new(dir.path().join("state"));

        let record = manager.save(&worker, &engine).unwrap();

        let path = manager.state_file(&worker);
        assert!(path.ends_with("state_rank-2"));
        assert!(path.is_file());
        assert!(!dir.path().join("state/state_rank-2.tmp").exists());
        assert_eq!(manager.load(&worker).unwrap(), record);
        assert_eq!(manager.phase(), CheckpointPhase::Running);
    }

    #[test]
    fn test_restore_applies_blob_and_positions() {
        let dir = tempdir().unwrap();
        let worker = Worker::solo();
        let mut manager = CheckpointManager::new(dir.path());
        let saved = Counters {
            blob: b"s1".to_vec(),
            positions: vec![5, 6, 7],
        };
        manager.save(&worker, &saved).unwrap();

        let mut live = Counters {
            blob: b"other".to_vec(),
            positions: vec![0, 0, 0],
        };
        let record = manager.load(&worker).unwrap();
        manager.restore(&worker, &mut live, &record).unwrap();

        assert_eq!(live.blob, b"s1");
        assert_eq!(live.positions, vec![5, 6, 7]);
    }

    #[test]
    fn test_mismatch_leaves_engine_untouched_and_fails() {
        let worker = Worker::solo();
        let mut manager = CheckpointManager::new("unused");
        let record = CheckpointRecord::new(b"new".to_vec(), vec![1, 2]);
        let mut live = Counters {
            blob: b"old".to_vec(),
            positions: vec![9, 9, 9],
        };

        let err = manager.restore(&worker, &mut live, &record).unwrap_err();

        assert!(matches!(err, CheckpointError::StateMismatch { saved: 2, live: 3 }));
        assert_eq!(live.blob, b"old");
        assert_eq!(live.positions, vec![9, 9, 9]);
        assert_eq!(manager.phase(), CheckpointPhase::Failed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let worker = Worker::solo();
        let mut manager = CheckpointManager::new("unused");
        let mut live = Counters {
            blob: Vec::new(),
            positions: vec![1],
        };
        let corrupt = CheckpointRecord::new(b"corrupt".to_vec(), vec![3]);

        assert!(matches!(
            manager.restore(&worker, &mut live, &corrupt),
            Err(CheckpointError::Engine(_))
        ));
        assert_eq!(manager.phase(), CheckpointPhase::Failed);

        let good = CheckpointRecord::new(Vec::new(), vec![3]);
        assert!(matches!(
            manager.restore(&worker, &mut live, &good),
            Err(CheckpointError::InvalidPhase {
                phase: CheckpointPhase::Failed
            })
        ));
        assert!(matches!(
            manager.save(&worker, &live),
            Err(CheckpointError::InvalidPhase { .. })
        ));
    }

    #[test]
    fn test_load_missing_and_foreign_files() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(dir.path());
        let worker = Worker::new(1, 2).unwrap();

        assert!(matches!(manager.load(&worker), Err(CheckpointError::Io { .. })));

        // A file written by rank 0 placed under rank 1's name.
        let bytes = CheckpointRecord::new(Vec::new(), vec![1]).encode(0).unwrap();
        fs::write(manager.state_file(&worker), bytes).unwrap();
        assert!(matches!(
            manager.load(&worker),
            Err(CheckpointError::RankMismatch {
                expected: 1,
                found: 0
            })
        ));
    }

    #[test]
    fn test_save_overwrites_previous() {
        let dir = tempdir().unwrap();
        let worker = Worker::solo();
        let mut manager = CheckpointManager::new(dir.path());

        let mut engine = Counters {
            blob: b"first".to_vec(),
            positions: vec![1],
        };
        manager.save(&worker, &engine).unwrap();
        engine.blob = b"second".to_vec();
        engine.positions = vec![2];
        manager.save(&worker, &engine).unwrap();

        let record = manager.load(&worker).unwrap();
        assert_eq!(record.state_blob, b"second");
        assert_eq!(record.rng_sequence, vec![2]);
    }
}
