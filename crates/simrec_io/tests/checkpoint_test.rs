//! Save/restore determinism through real state files.

use simrec_core::{SeededStream, StateCapturable, StreamPosition, Worker};
use simrec_io::checkpoint::{CheckpointError, CheckpointManager, CheckpointPhase};
use std::fmt;
use tempfile::tempdir;

#[derive(Debug)]
struct BlobError;

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blob is not eight bytes")
    }
}

impl std::error::Error for BlobError {}

/// A handful of streams plus an accumulator standing in for engine state.
struct StreamBank {
    streams: Vec<SeededStream>,
    acc: f64,
}

impl StreamBank {
    fn new(count: u64) -> Self {
        Self {
            streams: (0..count).map(|i| SeededStream::from_seed(1000 + i)).collect(),
            acc: 0.0,
        }
    }

    fn step(&mut self) -> Vec<f64> {
        let draws: Vec<f64> = self.streams.iter_mut().map(SeededStream::gen_normal).collect();
        self.acc += draws.iter().sum::<f64>();
        draws
    }
}

impl StateCapturable for StreamBank {
    type Error = BlobError;

    fn capture_state(&self) -> Result<Vec<u8>, BlobError> {
        Ok(self.acc.to_le_bytes().to_vec())
    }

    fn apply_state(&mut self, blob: &[u8]) -> Result<(), BlobError> {
        let bytes: [u8; 8] = blob.try_into().map_err(|_| BlobError)?;
        self.acc = f64::from_le_bytes(bytes);
        Ok(())
    }

    fn stream_positions(&self) -> Vec<StreamPosition> {
        self.streams.iter().map(SeededStream::position).collect()
    }

    fn set_stream_positions(&mut self, positions: &[StreamPosition]) {
        for (stream, position) in self.streams.iter_mut().zip(positions) {
            stream.set_position(*position);
        }
    }
}

#[test]
fn test_restore_reproduces_subsequent_draws() {
    let dir = tempdir().unwrap();
    let worker = Worker::new(1, 3).unwrap();

    let mut original = StreamBank::new(4);
    for _ in 0..25 {
        original.step();
    }
    let mut manager = CheckpointManager::new(dir.path());
    manager.save(&worker, &original).unwrap();
    let continued: Vec<Vec<f64>> = (0..10).map(|_| original.step()).collect();

    // A fresh process rebuilds the engine from the model, then restores.
    let mut resumed = StreamBank::new(4);
    let mut manager = CheckpointManager::new(dir.path());
    let record = manager.load(&worker).unwrap();
    manager.restore(&worker, &mut resumed, &record).unwrap();
    let replayed: Vec<Vec<f64>> = (0..10).map(|_| resumed.step()).collect();

    assert_eq!(continued, replayed);
    assert_eq!(original.acc, resumed.acc);
    assert_eq!(manager.phase(), CheckpointPhase::Running);
}

#[test]
fn test_mismatched_stream_count_is_rejected() {
    let dir = tempdir().unwrap();
    let worker = Worker::solo();

    let mut saved = StreamBank::new(3);
    saved.step();
    CheckpointManager::new(dir.path()).save(&worker, &saved).unwrap();

    let mut live = StreamBank::new(2);
    let before = live.stream_positions();
    let mut manager = CheckpointManager::new(dir.path());
    let record = manager.load(&worker).unwrap();
    let err = manager.restore(&worker, &mut live, &record).unwrap_err();

    assert!(matches!(err, CheckpointError::StateMismatch { saved: 3, live: 2 }));
    assert_eq!(live.stream_positions(), before);
    assert_eq!(live.acc, 0.0);
}

#[test]
fn test_each_worker_keeps_its_own_file() {
    let dir = tempdir().unwrap();
    let mut banks: Vec<_> = (0..3).map(|i| StreamBank::new(i + 1)).collect();

    for (rank, bank) in banks.iter_mut().enumerate() {
        bank.step();
        let worker = Worker::new(rank, 3).unwrap();
        CheckpointManager::new(dir.path()).save(&worker, bank).unwrap();
    }

    for (rank, bank) in banks.iter().enumerate() {
        let worker = Worker::new(rank, 3).unwrap();
        let record = CheckpointManager::new(dir.path()).load(&worker).unwrap();
        assert_eq!(record.stream_count(), rank + 1);
        assert_eq!(record.rng_sequence, bank.stream_positions());
    }
}
