//! # simrec_core
//!
//! Foundation layer of the simrec workspace. It holds the pieces every
//! other crate consumes but which perform no file I/O of their own:
//!
//! - [`worker`]: immutable worker identity (rank, group size, leadership)
//! - [`coordinator`]: the cross-worker barrier and leader-rooted broadcast
//! - [`capability`]: narrow interfaces onto the external simulation engine
//! - [`rng`]: seeded random streams whose position can be saved and re-applied
//! - [`types`]: entity identifiers and recorded-variable descriptors
//!
//! ## Usage Example
//!
//! ```rust
//! use simrec_core::coordinator::{broadcast_value, Coordinator, SoloCoordinator};
//!
//! let coordinator = SoloCoordinator::new();
//! let worker = coordinator.worker();
//! assert!(worker.is_leader());
//!
//! // The leader's decision reaches every worker, not just a barrier arrival.
//! let decided: u32 = broadcast_value(&coordinator, Some(&7)).unwrap();
//! assert_eq!(decided, 7);
//! ```

#![warn(missing_docs)]

pub mod capability;
pub mod coordinator;
pub mod rng;
pub mod types;
pub mod worker;

pub use capability::{Engine, Sampler, StateCapturable, StreamPosition};
pub use coordinator::{Coordinator, CoordinatorError, SoloCoordinator, ThreadCoordinator};
pub use rng::SeededStream;
pub use types::{EntityId, RecordedVariable};
pub use worker::Worker;
