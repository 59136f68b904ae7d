//! Captured checkpoint state and its binary encoding.
//!
//! A checkpoint file is a single integrity frame (magic `SRCK`) whose
//! bincode payload holds the writer's rank, the engine blob and the stream
//! positions in enumeration order.

use super::manager::{CheckpointError, CheckpointResult};
use crate::codec;
use serde::{Deserialize, Serialize};
use simrec_core::StreamPosition;

/// File magic.
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"SRCK";

/// Current format version.
pub const CHECKPOINT_VERSION: u16 = 2;

/// File name prefix; the worker rank is appended.
pub const STATE_FILE_PREFIX: &str = "state_rank-";

/// State of one worker at a step boundary.
///
/// `rng_sequence[i]` is the position of the i-th stream in the engine's
/// enumeration order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Opaque engine state.
    pub state_blob: Vec<u8>,
    /// Ordered stream positions.
    pub rng_sequence: Vec<StreamPosition>,
}

impl CheckpointRecord {
    /// Creates a record.
    pub fn new(state_blob: Vec<u8>, rng_sequence: Vec<StreamPosition>) -> Self {
        Self {
            state_blob,
            rng_sequence,
        }
    }

    /// Number of streams captured.
    #[inline]
    pub fn stream_count(&self) -> usize {
        self.rng_sequence.len()
    }

    /// Encodes the record as written by worker `rank`.
    pub fn encode(&self, rank: usize) -> CheckpointResult<Vec<u8>> {
        let rank = u32::try_from(rank)
            .map_err(|_| CheckpointError::Format(format!("rank {rank} does not fit in u32")))?;
        let envelope = Envelope {
            rank,
            record: self.clone(),
        };
        codec::encode(CHECKPOINT_MAGIC, CHECKPOINT_VERSION, &envelope)
            .map_err(|err| CheckpointError::Format(err.to_string()))
    }

    /// Decodes a record, returning it with the rank that wrote it.
    pub fn decode(bytes: &[u8]) -> CheckpointResult<(usize, Self)> {
        let (envelope, trailing): (Envelope, _) =
            codec::decode(CHECKPOINT_MAGIC, CHECKPOINT_VERSION, bytes)
                .map_err(|err| CheckpointError::Format(err.to_string()))?;
        if !trailing.is_empty() {
            return Err(CheckpointError::Format(format!(
                "{} bytes after the checkpoint payload",
                trailing.len()
            )));
        }
        Ok((envelope.rank as usize, envelope.record))
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    rank: u32,
    record: CheckpointRecord,
}
