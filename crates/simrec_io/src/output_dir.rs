//! Output directory lifecycle.
//!
//! Exactly one worker, the leader, touches the filesystem. It decides the
//! outcome of the preparation and broadcasts it; every other worker waits in
//! the broadcast and adopts that outcome. A worker therefore never moves on
//! having only seen the others arrive at a barrier: it either receives
//! `Ready` or fails with the leader's error.
//!
//! ```text
//! Uninitialized ──prepare──▶ Preparing ──▶ Ready
//!                                     └──▶ Error
//! ```

use serde::{Deserialize, Serialize};
use simrec_core::coordinator::broadcast_value;
use simrec_core::{Coordinator, CoordinatorError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info};

/// Default name of the per-entity dataset directory under the output root.
pub const DEFAULT_CELL_VARS_DIR: &str = "cellvars";

/// Default name of the checkpoint directory under the output root.
pub const DEFAULT_STATE_DIR: &str = "state";

/// Default name of the run log file under the output root.
pub const DEFAULT_LOG_FILE: &str = "log.txt";

/// Name of the configuration snapshot written into a fresh output root.
pub const CONFIG_SNAPSHOT_FILE: &str = "config.json";

/// Output directory errors.
#[derive(Debug, Error)]
pub enum OutputDirError {
    /// Output root exists and overwriting is disabled.
    #[error("Output directory {path} already exists and overwrite is disabled")]
    Conflict {
        /// Conflicting path
        path: PathBuf,
    },

    /// Resuming requires an existing output tree with a state directory.
    #[error("Cannot resume: {path} does not exist")]
    MissingStateDirectory {
        /// Missing directory
        path: PathBuf,
    },

    /// Filesystem operation failed on the leader.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path being operated on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The leader failed for a reason only it can report in full.
    #[error("Leader failed to prepare the output directory: {message}")]
    Leader {
        /// Leader's error message
        message: String,
    },

    /// Broadcast of the outcome failed.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Result type for output directory operations.
pub type OutputDirResult<T> = Result<T, OutputDirError>;

/// Preparation state of the output tree, as observed by one worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectoryState {
    /// Nothing attempted yet.
    Uninitialized,
    /// Leader is creating the tree.
    Preparing,
    /// Tree exists and every worker has been told so.
    Ready,
    /// Preparation failed; terminal for the run.
    Error,
}

/// Paths making up a run's output tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputLayout {
    /// Output root.
    pub root: PathBuf,
    /// Directory of per-entity datasets.
    pub cell_vars_dir: PathBuf,
    /// Directory of per-worker checkpoint files.
    pub state_dir: PathBuf,
    /// Run log file.
    pub log_file: PathBuf,
}

impl OutputLayout {
    /// Layout with the default sub-paths under `root`.
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            cell_vars_dir: root.join(DEFAULT_CELL_VARS_DIR),
            state_dir: root.join(DEFAULT_STATE_DIR),
            log_file: root.join(DEFAULT_LOG_FILE),
            root,
        }
    }

    /// Path of the configuration snapshot.
    pub fn config_snapshot(&self) -> PathBuf {
        self.root.join(CONFIG_SNAPSHOT_FILE)
    }
}

/// A prepared output tree.
#[derive(Clone, Debug)]
pub struct OutputDirectory {
    layout: OutputLayout,
    state: DirectoryState,
}

impl OutputDirectory {
    /// Output root.
    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    /// Dataset directory.
    pub fn cell_vars_dir(&self) -> &Path {
        &self.layout.cell_vars_dir
    }

    /// Checkpoint directory.
    pub fn state_dir(&self) -> &Path {
        &self.layout.state_dir
    }

    /// Run log file.
    pub fn log_file(&self) -> &Path {
        &self.layout.log_file
    }

    /// Full layout.
    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Always [`DirectoryState::Ready`] for a value handed out by the manager.
    pub fn state(&self) -> DirectoryState {
        self.state
    }
}

/// Outcome decided by the leader and broadcast to the group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum PrepareOutcome {
    Ready,
    Conflict { path: PathBuf },
    MissingStateDirectory { path: PathBuf },
    Failed { message: String },
}

impl PrepareOutcome {
    fn from_result(result: &OutputDirResult<()>) -> Self {
        match result {
            Ok(()) => Self::Ready,
            Err(OutputDirError::Conflict { path }) => Self::Conflict { path: path.clone() },
            Err(OutputDirError::MissingStateDirectory { path }) => {
                Self::MissingStateDirectory { path: path.clone() }
            }
            Err(other) => Self::Failed {
                message: other.to_string(),
            },
        }
    }

    fn into_result(self) -> OutputDirResult<()> {
        match self {
            Self::Ready => Ok(()),
            Self::Conflict { path } => Err(OutputDirError::Conflict { path }),
            Self::MissingStateDirectory { path } => {
                Err(OutputDirError::MissingStateDirectory { path })
            }
            Self::Failed { message } => Err(OutputDirError::Leader { message }),
        }
    }
}

/// Prepares the output tree on behalf of the whole worker group.
///
/// Every worker constructs its own manager around its own coordinator and
/// calls the same operation; the calls are collective.
pub struct OutputDirectoryManager<'c, C: Coordinator + ?Sized> {
    coordinator: &'c C,
    layout: OutputLayout,
    config_snapshot: Option<Vec<u8>>,
    state: DirectoryState,
}

impl<'c, C: Coordinator + ?Sized> OutputDirectoryManager<'c, C> {
    /// Creates a manager for `layout`.
    pub fn new(coordinator: &'c C, layout: OutputLayout) -> Self {
        Self {
            coordinator,
            layout,
            config_snapshot: None,
            state: DirectoryState::Uninitialized,
        }
    }

    /// Bytes the leader writes to [`CONFIG_SNAPSHOT_FILE`] after a fresh
    /// preparation.
    pub fn with_config_snapshot(mut self, snapshot: Vec<u8>) -> Self {
        self.config_snapshot = Some(snapshot);
        self
    }

    /// State as observed by this worker.
    pub fn state(&self) -> DirectoryState {
        self.state
    }

    /// Layout being prepared.
    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Creates a fresh output tree.
    ///
    /// On the leader: if the root exists it is removed recursively when
    /// `overwrite` is set, otherwise preparation fails with
    /// [`OutputDirError::Conflict`] and nothing is touched. The root, the
    /// dataset and state directories and the log file are then created, and
    /// the configuration snapshot written if one was given.
    ///
    /// Every worker returns the leader's outcome. Non-leaders see leader I/O
    /// failures as [`OutputDirError::Leader`].
    pub fn prepare(&mut self, overwrite: bool) -> OutputDirResult<OutputDirectory> {
        self.run_collective(|manager| manager.create_tree(overwrite))
    }

    /// Checks that an existing tree can be resumed from, without mutating it.
    ///
    /// Fails with [`OutputDirError::MissingStateDirectory`] on every worker
    /// when the root or its state directory is absent.
    pub fn prepare_resume(&mut self) -> OutputDirResult<OutputDirectory> {
        self.run_collective(|manager| manager.verify_tree())
    }

    fn run_collective<F>(&mut self, leader_work: F) -> OutputDirResult<OutputDirectory>
    where
        F: FnOnce(&Self) -> OutputDirResult<()>,
    {
        let worker = self.coordinator.worker();
        self.state = DirectoryState::Preparing;

        let local = if worker.is_leader() {
            let result = leader_work(self);
            Some(result)
        } else {
            None
        };
        let proposal = local.as_ref().map(PrepareOutcome::from_result);

        let outcome = match broadcast_value(self.coordinator, proposal.as_ref()) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.state = DirectoryState::Error;
                error!(rank = worker.rank(), error = %err, "Directory outcome broadcast failed");
                return Err(err.into());
            }
        };

        // The leader keeps its own error, which carries the io::Error source.
        let result = match local {
            Some(result) => result,
            None => outcome.into_result(),
        };

        match result {
            Ok(()) => {
                self.state = DirectoryState::Ready;
                debug!(rank = worker.rank(), root = %self.layout.root.display(), "Output directory ready");
                Ok(OutputDirectory {
                    layout: self.layout.clone(),
                    state: DirectoryState::Ready,
                })
            }
            Err(err) => {
                self.state = DirectoryState::Error;
                error!(rank = worker.rank(), error = %err, "Output directory preparation failed");
                Err(err)
            }
        }
    }

    fn create_tree(&self, overwrite: bool) -> OutputDirResult<()> {
        let layout = &self.layout;
        let root = &layout.root;

        if root.exists() {
            if !overwrite {
                return Err(OutputDirError::Conflict { path: root.clone() });
            }
            let removal = if root.is_dir() {
                fs::remove_dir_all(root)
            } else {
                fs::remove_file(root)
            };
            removal.map_err(io_error(root))?;
            info!(root = %root.display(), "Removed existing output directory");
        }

        for dir in [root, &layout.cell_vars_dir, &layout.state_dir] {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }

        if let Some(parent) = layout.log_file.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::File::create(&layout.log_file).map_err(io_error(&layout.log_file))?;

        if let Some(snapshot) = &self.config_snapshot {
            let path = layout.config_snapshot();
            fs::write(&path, snapshot).map_err(io_error(&path))?;
        }

        info!(root = %root.display(), "Created output directory");
        Ok(())
    }

    fn verify_tree(&self) -> OutputDirResult<()> {
        for dir in [&self.layout.root, &self.layout.state_dir] {
            if !dir.is_dir() {
                return Err(OutputDirError::MissingStateDirectory { path: dir.clone() });
            }
        }
        info!(root = %self.layout.root.display(), "Resuming into existing output directory");
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> OutputDirError + '_ {
    move |source| OutputDirError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrec_core::SoloCoordinator;
    use tempfile::tempdir;

    #[test]
    fn test_default_layout() {
        let layout = OutputLayout::under("/tmp/run");
        assert_eq!(layout.cell_vars_dir, PathBuf::from("/tmp/run/cellvars"));
        assert_eq!(layout.state_dir, PathBuf::from("/tmp/run/state"));
        assert_eq!(layout.log_file, PathBuf::from("/tmp/run/log.txt"));
        assert_eq!(layout.config_snapshot(), PathBuf::from("/tmp/run/config.json"));
    }

    #[test]
    fn test_prepare_fresh_directory() {
        let tmp = tempdir().unwrap();
        let coordinator = SoloCoordinator::new();
        let layout = OutputLayout::under(tmp.path().join("out"));
        let mut manager = OutputDirectoryManager::new(&coordinator, layout)
            .with_config_snapshot(b"{\"run\":{}}".to_vec());

        assert_eq!(manager.state(), DirectoryState::Uninitialized);
        let dir = manager.prepare(false).unwrap();

        assert_eq!(manager.state(), DirectoryState::Ready);
        assert_eq!(dir.state(), DirectoryState::Ready);
        assert!(dir.cell_vars_dir().is_dir());
        assert!(dir.state_dir().is_dir());
        assert!(dir.log_file().is_file());
        assert_eq!(
            fs::read(dir.layout().config_snapshot()).unwrap(),
            b"{\"run\":{}}"
        );
    }

    #[test]
    fn test_conflict_leaves_contents() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("out");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("keep.txt"), b"data").unwrap();

        let coordinator = SoloCoordinator::new();
        let mut manager = OutputDirectoryManager::new(&coordinator, OutputLayout::under(&root));
        let err = manager.prepare(false).unwrap_err();

        assert!(matches!(err, OutputDirError::Conflict { ref path } if *path == root));
        assert_eq!(manager.state(), DirectoryState::Error);
        assert_eq!(fs::read(root.join("keep.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_overwrite_replaces_file_at_root() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("out");
        fs::write(&root, b"not a directory").unwrap();

        let coordinator = SoloCoordinator::new();
        let mut manager = OutputDirectoryManager::new(&coordinator, OutputLayout::under(&root));
        let dir = manager.prepare(true).unwrap();
        assert!(dir.root().is_dir());
    }

    #[test]
    fn test_prepare_resume_requires_state_dir() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("out");
        fs::create_dir_all(&root).unwrap();

        let coordinator = SoloCoordinator::new();
        let layout = OutputLayout::under(&root);
        let state_dir = layout.state_dir.clone();
        let mut manager = OutputDirectoryManager::new(&coordinator, layout);

        let err = manager.prepare_resume().unwrap_err();
        assert!(matches!(err, OutputDirError::MissingStateDirectory { ref path } if *path == state_dir));

        fs::create_dir_all(&state_dir).unwrap();
        let mut manager = OutputDirectoryManager::new(&coordinator, OutputLayout::under(&root));
        assert!(manager.prepare_resume().is_ok());
    }

    #[test]
    fn test_outcome_maps_leader_io_to_message() {
        let io = OutputDirError::Io {
            path: PathBuf::from("/x"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        let outcome = PrepareOutcome::from_result(&Err(io));
        match outcome.into_result() {
            Err(OutputDirError::Leader { message }) => assert!(message.contains("denied")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
