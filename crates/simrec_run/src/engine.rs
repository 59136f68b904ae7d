//! Reference engine: point cells driven by Ornstein–Uhlenbeck noise.
//!
//! Each cell carries a membrane voltage `v` and an intracellular calcium
//! concentration `cai`, both relaxing towards a resting value under
//! Gaussian noise drawn from the cell's own [`SeededStream`]. Cells are
//! independent, so a step advances them in parallel.
//!
//! Streams are enumerated in ascending entity id order: the cells live in a
//! vector sorted by id, and that order is fixed at construction.

use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use simrec_core::{Engine, EntityId, Sampler, SeededStream, StateCapturable, StreamPosition, Worker};
use thiserror::Error;

/// Reference engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// State blob could not be encoded or decoded.
    #[error("Engine state (de)serialisation failed: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// State blob describes a different set of cells.
    #[error("Engine state is for cells {blob:?}, engine holds {live:?}")]
    CellMismatch {
        /// Cells in the blob
        blob: Vec<EntityId>,
        /// Cells in the engine
        live: Vec<EntityId>,
    },

    /// Noise parameters are not usable.
    #[error("Invalid noise parameter: {0}")]
    InvalidParameter(String),
}

/// Ornstein–Uhlenbeck parameters for both variables.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NoiseParams {
    /// Resting voltage (mV).
    pub v_rest: f64,
    /// Voltage relaxation time constant (ms).
    pub tau_v: f64,
    /// Voltage noise amplitude (mV / sqrt(ms)).
    pub sigma_v: f64,
    /// Resting calcium concentration (mM).
    pub cai_rest: f64,
    /// Calcium relaxation time constant (ms).
    pub tau_cai: f64,
    /// Calcium noise amplitude (mM / sqrt(ms)).
    pub sigma_cai: f64,
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            v_rest: -65.0,
            tau_v: 10.0,
            sigma_v: 1.5,
            cai_rest: 5e-5,
            tau_cai: 80.0,
            sigma_cai: 2e-6,
        }
    }
}

/// Dynamic state of one cell.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    /// Membrane voltage.
    pub v: f64,
    /// Intracellular calcium.
    pub cai: f64,
}

#[derive(Serialize, Deserialize)]
struct EngineSnapshot {
    step: u64,
    cells: Vec<(EntityId, CellState)>,
}

#[derive(Clone, Debug)]
struct Cell {
    id: EntityId,
    state: CellState,
    stream: SeededStream,
}

/// Per-step increments, precomputed from the parameters and `dt`.
#[derive(Clone, Copy, Debug)]
struct StepKernel {
    params: NoiseParams,
    dt: f64,
    v_noise: Normal<f64>,
    cai_noise: Normal<f64>,
}

impl StepKernel {
    fn new(params: NoiseParams, dt: f64) -> Result<Self, EngineError> {
        if !(dt > 0.0 && params.tau_v > 0.0 && params.tau_cai > 0.0) {
            return Err(EngineError::InvalidParameter(format!(
                "dt, tau_v and tau_cai must be positive (dt = {dt})"
            )));
        }
        let sqrt_dt = dt.sqrt();
        let normal = |sigma: f64| {
            Normal::new(0.0, sigma * sqrt_dt)
                .map_err(|err| EngineError::InvalidParameter(err.to_string()))
        };
        Ok(Self {
            params,
            dt,
            v_noise: normal(params.sigma_v)?,
            cai_noise: normal(params.sigma_cai)?,
        })
    }

    #[inline]
    fn apply(&self, cell: &mut Cell) {
        let p = &self.params;
        let state = &mut cell.state;
        state.v += (p.v_rest - state.v) / p.tau_v * self.dt + cell.stream.sample(&self.v_noise);
        state.cai += (p.cai_rest - state.cai) / p.tau_cai * self.dt + cell.stream.sample(&self.cai_noise);
        // Concentrations stay non-negative.
        state.cai = state.cai.max(0.0);
    }
}

/// Noise-driven cells owned by one worker.
#[derive(Clone, Debug)]
pub struct NoisyCellEngine {
    cells: Vec<Cell>,
    kernel: StepKernel,
    step: u64,
}

impl NoisyCellEngine {
    /// Variables this engine can be sampled for.
    pub const VARIABLES: [&'static str; 2] = ["v", "cai"];

    /// Builds the cells of `all_ids` owned by `worker`.
    ///
    /// Every cell's stream is seeded from `seed` and its id only, so the
    /// same cell draws the same numbers whatever the group size.
    pub fn for_worker(
        worker: &Worker,
        all_ids: impl IntoIterator<Item = EntityId>,
        seed: u64,
        dt: f64,
    ) -> Result<Self, EngineError> {
        Self::with_params(worker, all_ids, seed, dt, NoiseParams::default())
    }

    /// As [`for_worker`](Self::for_worker) with explicit noise parameters.
    pub fn with_params(
        worker: &Worker,
        all_ids: impl IntoIterator<Item = EntityId>,
        seed: u64,
        dt: f64,
        params: NoiseParams,
    ) -> Result<Self, EngineError> {
        let kernel = StepKernel::new(params, dt)?;

        let mut ids: Vec<EntityId> = all_ids.into_iter().filter(|id| worker.owns(*id)).collect();
        ids.sort_unstable();
        ids.dedup();

        let cells = ids
            .into_iter()
            .map(|id| Cell {
                id,
                state: CellState {
                    v: params.v_rest,
                    cai: params.cai_rest,
                },
                stream: SeededStream::from_seed(cell_seed(seed, id)),
            })
            .collect();

        Ok(Self {
            cells,
            kernel,
            step: 0,
        })
    }

    /// Steps advanced since construction (or since the restored checkpoint).
    pub fn step(&self) -> u64 {
        self.step
    }

    /// State of `entity`, if owned.
    pub fn cell_state(&self, entity: EntityId) -> Option<CellState> {
        self.find(entity).map(|cell| cell.state)
    }

    fn find(&self, entity: EntityId) -> Option<&Cell> {
        self.cells
            .binary_search_by_key(&entity, |cell| cell.id)
            .ok()
            .map(|index| &self.cells[index])
    }

    fn ids(&self) -> Vec<EntityId> {
        self.cells.iter().map(|cell| cell.id).collect()
    }
}

fn cell_seed(seed: u64, id: EntityId) -> u64 {
    seed ^ id.get().wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

impl Sampler for NoisyCellEngine {
    fn sample(&self, entity: EntityId, variable: &str) -> f64 {
        match (self.find(entity), variable) {
            (Some(cell), "v") => cell.state.v,
            (Some(cell), "cai") => cell.state.cai,
            _ => f64::NAN,
        }
    }
}

impl StateCapturable for NoisyCellEngine {
    type Error = EngineError;

    fn capture_state(&self) -> Result<Vec<u8>, EngineError> {
        let snapshot = EngineSnapshot {
            step: self.step,
            cells: self.cells.iter().map(|cell| (cell.id, cell.state)).collect(),
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn apply_state(&mut self, blob: &[u8]) -> Result<(), EngineError> {
        let snapshot: EngineSnapshot = serde_json::from_slice(blob)?;
        let blob_ids: Vec<EntityId> = snapshot.cells.iter().map(|(id, _)| *id).collect();
        if blob_ids != self.ids() {
            return Err(EngineError::CellMismatch {
                blob: blob_ids,
                live: self.ids(),
            });
        }

        for (cell, (_, state)) in self.cells.iter_mut().zip(snapshot.cells) {
            cell.state = state;
        }
        self.step = snapshot.step;
        Ok(())
    }

    fn stream_positions(&self) -> Vec<StreamPosition> {
        self.cells.iter().map(|cell| cell.stream.position()).collect()
    }

    fn stream_count(&self) -> usize {
        self.cells.len()
    }

    fn set_stream_positions(&mut self, positions: &[StreamPosition]) {
        for (cell, position) in self.cells.iter_mut().zip(positions) {
            cell.stream.set_position(*position);
        }
    }
}

impl Engine for NoisyCellEngine {
    fn entities(&self) -> Vec<EntityId> {
        self.ids()
    }

    fn advance(&mut self) {
        let kernel = self.kernel;
        self.cells.par_iter_mut().for_each(|cell| kernel.apply(cell));
        self.step += 1;
    }
}
