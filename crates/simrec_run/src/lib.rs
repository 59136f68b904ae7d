//! # simrec_run
//!
//! Everything needed to carry out a recorded run on top of `simrec_core`
//! and `simrec_io`:
//!
//! - [`config`]: the layered run configuration
//! - [`logging`]: per-worker tracing with a leader-only run log
//! - [`engine`]: a reference noise-driven cell engine
//! - [`driver`]: the run loop, single worker or an in-process group
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use simrec_run::{run_thread_group, NoisyCellEngine, RunConfig};
//! use simrec_core::EntityId;
//!
//! let config = RunConfig::load("simulation_config.toml")?;
//! let results = run_thread_group(&config, 4, |worker| {
//!     Ok(NoisyCellEngine::for_worker(worker, (0..100).map(EntityId), 42, config.run.dt)?)
//! })?;
//! for summary in results {
//!     println!("{:?}", summary?.flushed_ranges);
//! }
//! ```

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod logging;

pub use crate::config::{ConfigError, LogLevel, RunConfig};
pub use driver::{run_thread_group, Driver, RunSummary};
pub use engine::{CellState, EngineError, NoiseParams, NoisyCellEngine};
pub use error::{RunError, RunResult};
pub use logging::{init_tracing, leader_milestone, run_subscriber};
