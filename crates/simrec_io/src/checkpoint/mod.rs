//! Per-worker checkpoints for deterministic resumption.
//!
//! A checkpoint captures two things from the engine: an opaque state blob
//! and the position of every random stream, in the engine's enumeration
//! order. Restoring applies the blob and then the i-th saved position to the
//! i-th live stream, so a resumed run draws exactly the numbers the original
//! run would have drawn next.
//!
//! # Key Components
//!
//! - [`CheckpointRecord`]: the captured state and its on-disk encoding
//! - [`CheckpointManager`]: save, load and restore with a per-worker phase
//! - [`CheckpointPhase`]: Running, Saving, Restoring, Failed
//!
//! # File Format
//!
//! One file per worker, `<state_dir>/state_rank-<rank>`:
//!
//! ```text
//! "SRCK" | version u16 | crc32 u32 | payload_len u64 | payload
//! ```
//!
//! The payload is bincode: the rank, the blob and the positions, one per
//! stream. A flipped bit anywhere in the payload fails the checksum on
//! load. Files are written to a temporary sibling and renamed into
//! place, so a crash mid-save leaves the previous checkpoint intact.
//!
//! # Example
//!
//! ```rust,ignore
//! use simrec_io::checkpoint::CheckpointManager;
//!
//! let mut checkpoints = CheckpointManager::new(output.state_dir());
//! checkpoints.save(&worker, &engine)?;
//!
//! // Later, in a fresh process:
//! let record = checkpoints.load(&worker)?;
//! checkpoints.restore(&worker, &mut engine, &record)?;
//! ```

mod manager;
mod state;

pub use manager::{CheckpointError, CheckpointManager, CheckpointPhase, CheckpointResult};
pub use state::{CheckpointRecord, CHECKPOINT_MAGIC, CHECKPOINT_VERSION, STATE_FILE_PREFIX};
