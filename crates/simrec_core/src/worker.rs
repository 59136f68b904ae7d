//! Worker identity within a fixed-size group.

use crate::coordinator::CoordinatorError;
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One process (or thread) in a fixed-size group of cooperating workers.
///
/// Created once at start-up and immutable afterwards. The worker with rank
/// [`Worker::LEADER_RANK`] is the leader: the single worker allowed to
/// perform filesystem side effects shared by the whole group.
///
/// # Examples
///
/// ```rust
/// use simrec_core::Worker;
///
/// let worker = Worker::new(2, 4).unwrap();
/// assert_eq!(worker.rank(), 2);
/// assert!(!worker.is_leader());
/// assert!(Worker::new(4, 4).is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Worker {
    rank: usize,
    group_size: usize,
}

impl Worker {
    /// Rank of the leader worker.
    pub const LEADER_RANK: usize = 0;

    /// Creates a worker identity.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidRank`] when `rank >= group_size`
    /// (which also rejects an empty group).
    pub fn new(rank: usize, group_size: usize) -> Result<Self, CoordinatorError> {
        if rank >= group_size {
            return Err(CoordinatorError::InvalidRank { rank, group_size });
        }
        Ok(Self { rank, group_size })
    }

    /// The only worker of a group of one.
    pub fn solo() -> Self {
        Self {
            rank: Self::LEADER_RANK,
            group_size: 1,
        }
    }

    /// Rank of this worker in `[0, group_size)`.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of workers in the group.
    #[inline]
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// True for the rank-zero worker.
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.rank == Self::LEADER_RANK
    }

    /// Round-robin ownership: entity `id` lives on rank `id % group_size`.
    #[inline]
    pub fn owns(&self, entity: EntityId) -> bool {
        (entity.get() % self.group_size as u64) as usize == self.rank
    }
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rank {}/{}", self.rank, self.group_size)
    }
}
