//! Narrow capability interfaces onto the external simulation engine.
//!
//! The recorder depends only on [`Sampler`]; the checkpoint manager depends
//! only on [`StateCapturable`]. An adapter around the real engine
//! implements both.

use crate::types::EntityId;

/// Position of one random-number stream, in 32-bit words from its start.
pub type StreamPosition = u128;

/// Read access to sampled variable values.
pub trait Sampler {
    /// Current value of `variable` on `entity`.
    ///
    /// Called once per recorded (entity, variable) per simulation step.
    /// Unknown variables yield `f64::NAN` rather than an error so that a
    /// bad selection shows up in the data instead of aborting a long run.
    fn sample(&self, entity: EntityId, variable: &str) -> f64;
}

/// Capture and re-application of a worker's full engine state.
///
/// # Stream ordering contract
///
/// [`stream_positions`](Self::stream_positions) and
/// [`set_stream_positions`](Self::set_stream_positions) must enumerate the
/// engine's random streams in the same order on every call and in every
/// process that constructs the engine from the same model. Checkpoint
/// restoration applies the i-th saved position to the i-th stream; an
/// unstable order silently breaks determinism. Implementations should key
/// their streams in a sorted container rather than rely on registration or
/// hash order.
pub trait StateCapturable {
    /// Engine-specific error for state (de)serialisation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opaque snapshot of the engine's state, excluding stream positions.
    fn capture_state(&self) -> Result<Vec<u8>, Self::Error>;

    /// Reloads a snapshot produced by [`capture_state`](Self::capture_state).
    ///
    /// Implementations must validate the blob before mutating anything.
    fn apply_state(&mut self, blob: &[u8]) -> Result<(), Self::Error>;

    /// Positions of every registered random stream, in enumeration order.
    fn stream_positions(&self) -> Vec<StreamPosition>;

    /// Number of registered random streams.
    fn stream_count(&self) -> usize {
        self.stream_positions().len()
    }

    /// Re-applies positions in enumeration order.
    ///
    /// Callers guarantee `positions.len() == self.stream_count()`.
    fn set_stream_positions(&mut self, positions: &[StreamPosition]);
}

/// A steppable engine owning a set of entities on this worker.
pub trait Engine: Sampler + StateCapturable {
    /// Entities simulated on this worker, ascending.
    fn entities(&self) -> Vec<EntityId>;

    /// Advances the simulated state by one time step.
    fn advance(&mut self);
}
