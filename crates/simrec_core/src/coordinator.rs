//! Cross-worker coordination.
//!
//! Workers share no memory. The only coordination this workspace needs is
//! a blocking barrier and a leader-rooted broadcast. Barrier arrival alone
//! says nothing about *what* the leader decided, so decisions that gate the
//! whole group (such as the output-directory outcome) travel through
//! [`broadcast_value`], which returns the leader's value on every worker.
//!
//! # Implementations
//!
//! - [`SoloCoordinator`]: a group of one.
//! - [`ThreadCoordinator`]: an in-process group, one coordinator per
//!   worker thread, created with [`thread_group`].
//!
//! A message-passing (MPI) adapter implements [`Coordinator`] outside this
//! workspace.

use crate::worker::Worker;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Barrier, Mutex, PoisonError};
use thiserror::Error;

/// Errors raised by the coordination layer.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Rank outside `[0, group_size)`.
    #[error("Invalid rank {rank} for a group of {group_size} workers")]
    InvalidRank {
        /// Requested rank
        rank: usize,
        /// Group size
        group_size: usize,
    },

    /// The leader's value could not be encoded for broadcast.
    #[error("Failed to encode broadcast payload: {0}")]
    Encode(#[source] serde_json::Error),

    /// A received broadcast payload could not be decoded.
    #[error("Failed to decode broadcast payload: {0}")]
    Decode(#[source] serde_json::Error),

    /// The leader took part in the broadcast without a value.
    #[error("Leader broadcast carried no value")]
    MissingLeaderValue,
}

/// Abstraction over a fixed-size group of parallel workers.
///
/// Both collective operations block until every worker of the group has
/// called them; callers must invoke them in the same order on every worker.
pub trait Coordinator: Send + Sync {
    /// Identity of the calling worker.
    fn worker(&self) -> Worker;

    /// Blocks until every worker has arrived.
    fn barrier(&self);

    /// Leader-rooted broadcast.
    ///
    /// The leader's `payload` is returned on every worker; payloads passed
    /// by non-leaders are ignored. Returns only after every worker arrived.
    fn broadcast(&self, payload: Vec<u8>) -> Vec<u8>;
}

/// Broadcasts a typed value from the leader to the whole group.
///
/// The leader passes `Some(value)`; other workers pass `None`. Every worker,
/// the leader included, receives the decoded leader value.
///
/// # Errors
///
/// - [`CoordinatorError::Encode`] on the leader if encoding failed; the
///   other workers then see [`CoordinatorError::MissingLeaderValue`]
/// - [`CoordinatorError::MissingLeaderValue`] if the leader passed `None`
/// - [`CoordinatorError::Decode`] if the payload is not a valid `T`
pub fn broadcast_value<C, T>(coordinator: &C, value: Option<&T>) -> Result<T, CoordinatorError>
where
    C: Coordinator + ?Sized,
    T: Serialize + DeserializeOwned,
{
    let mut encode_error = None;
    let payload = if coordinator.worker().is_leader() {
        match serde_json::to_vec(&value) {
            Ok(bytes) => bytes,
            Err(err) => {
                // Still take part in the collective so nobody deadlocks.
                encode_error = Some(err);
                b"null".to_vec()
            }
        }
    } else {
        Vec::new()
    };

    let received = coordinator.broadcast(payload);
    if let Some(err) = encode_error {
        return Err(CoordinatorError::Encode(err));
    }

    let decoded: Option<T> = serde_json::from_slice(&received).map_err(CoordinatorError::Decode)?;
    decoded.ok_or(CoordinatorError::MissingLeaderValue)
}

// =============================================================================
// Group of one
// =============================================================================

/// Coordinator for a single-worker run.
#[derive(Clone, Copy, Debug, Default)]
pub struct SoloCoordinator;

impl SoloCoordinator {
    /// Creates the coordinator.
    pub fn new() -> Self {
        Self
    }
}

impl Coordinator for SoloCoordinator {
    fn worker(&self) -> Worker {
        Worker::solo()
    }

    fn barrier(&self) {}

    fn broadcast(&self, payload: Vec<u8>) -> Vec<u8> {
        payload
    }
}

// =============================================================================
// In-process thread group
// =============================================================================

struct GroupShared {
    barrier: Barrier,
    slot: Mutex<Vec<u8>>,
}

/// One member of an in-process worker group.
///
/// Each coordinator is moved into its own worker thread. Members share a
/// barrier and a single broadcast slot; nothing else is shared.
pub struct ThreadCoordinator {
    worker: Worker,
    shared: Arc<GroupShared>,
}

/// Creates the coordinators of an in-process group of `group_size` workers,
/// ordered by rank.
///
/// # Errors
///
/// Returns [`CoordinatorError::InvalidRank`] for an empty group.
///
/// # Examples
///
/// ```rust
/// use simrec_core::coordinator::{broadcast_value, thread_group, Coordinator};
/// use std::thread;
///
/// let group = thread_group(3).unwrap();
/// let handles: Vec<_> = group
///     .into_iter()
///     .map(|c| {
///         thread::spawn(move || {
///             let proposal = c.worker().rank() as u32 + 100;
///             broadcast_value(&c, Some(&proposal)).unwrap()
///         })
///     })
///     .collect();
///
/// for handle in handles {
///     assert_eq!(handle.join().unwrap(), 100);
/// }
/// ```
pub fn thread_group(group_size: usize) -> Result<Vec<ThreadCoordinator>, CoordinatorError> {
    if group_size == 0 {
        return Err(CoordinatorError::InvalidRank {
            rank: 0,
            group_size,
        });
    }

    let shared = Arc::new(GroupShared {
        barrier: Barrier::new(group_size),
        slot: Mutex::new(Vec::new()),
    });

    (0..group_size)
        .map(|rank| {
            Ok(ThreadCoordinator {
                worker: Worker::new(rank, group_size)?,
                shared: Arc::clone(&shared),
            })
        })
        .collect()
}

impl Coordinator for ThreadCoordinator {
    fn worker(&self) -> Worker {
        self.worker
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn broadcast(&self, payload: Vec<u8>) -> Vec<u8> {
        if self.worker.is_leader() {
            *self
                .shared
                .slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = payload;
        }
        self.shared.barrier.wait();

        let received = self
            .shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        // Nobody may overwrite the slot until every worker has read it.
        self.shared.barrier.wait();
        received
    }
}
