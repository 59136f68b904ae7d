//! Block-buffered recording of per-entity time series.
//!
//! Samples are staged in fixed-size in-memory blocks, one
//! [`SeriesBuffer`] per (entity, variable), and written to the entity's
//! dataset only at block boundaries. A run whose length is not a multiple
//! of the block size ends with one partial flush issued by
//! [`TimeSeriesRecorder::finalize`].
//!
//! # Accounting
//!
//! Across a run the ranges handed to [`TimeSeriesRecorder::flush_block`],
//! including the one issued by `finalize`, tile `[0, total_steps)` with no
//! gap and no overlap. The Driver guarantees increasing, non-overlapping
//! ranges; [`BlockSchedule`] produces exactly that cadence.
//!
//! # Example
//!
//! ```rust,ignore
//! use simrec_io::recorder::{BlockSchedule, RecordingPlan, TimeSeriesRecorder};
//!
//! let plan = RecordingPlan::new(100, 30, 0.1, 0.0, 10.0);
//! let mut recorder = TimeSeriesRecorder::new(worker, "output/cellvars");
//! recorder.initialize(&entities, &["v".to_string()], plan)?;
//!
//! for block in BlockSchedule::new(100, 30)? {
//!     for _ in block.clone() {
//!         engine.advance();
//!         recorder.sample_step(&engine)?;
//!     }
//!     if block.len() == 30 {
//!         recorder.flush_block(block)?;
//!     }
//! }
//! recorder.finalize(100)?; // flushes [90, 100)
//! ```

use crate::dataset::{DatasetAttrs, DatasetError, DatasetWriter, DATASET_EXTENSION};
use simrec_core::{EntityId, RecordedVariable, Sampler, Worker};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised while staging or flushing samples.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Dataset creation or write failed.
    #[error(transparent)]
    Dataset(#[from] DatasetError),

    /// Block size of zero.
    #[error("Invalid block size {0}: must be at least 1")]
    InvalidBlockSize(usize),

    /// Operation requires an initialised, not yet finalised recorder.
    #[error("Recorder is not recording (state: {state:?})")]
    NotRecording {
        /// State at the time of the call
        state: RecorderState,
    },

    /// Buffer already holds a full block.
    #[error("Buffer for {variable} is full ({capacity} samples); flush the block first")]
    BufferFull {
        /// Affected series
        variable: RecordedVariable,
        /// Block size
        capacity: usize,
    },

    /// (entity, variable) pair is not recorded on this worker.
    #[error("{variable} is not recorded on this worker")]
    UnknownSeries {
        /// Requested series
        variable: RecordedVariable,
    },

    /// Flush range is reversed, longer than a block, or past the run end.
    #[error("Invalid flush range {start}..{end} (block size {block_size}, total steps {total_steps})")]
    InvalidRange {
        /// Range start
        start: usize,
        /// Range end
        end: usize,
        /// Block size
        block_size: usize,
        /// Run length
        total_steps: usize,
    },
}

/// Result type for recorder operations.
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Lifecycle of a [`TimeSeriesRecorder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    /// Constructed; no datasets yet.
    Idle,
    /// Datasets created; accepting samples and flushes.
    Recording,
    /// Final block flushed and dataset handles released.
    Finalised,
}

/// Timing of a run as seen by the recorder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordingPlan {
    /// Number of recorded steps; every dataset has exactly this length.
    pub total_steps: usize,
    /// Samples staged per buffer before a flush.
    pub block_size: usize,
    /// Time step.
    pub dt: f64,
    /// Simulated start time.
    pub tstart: f64,
    /// Simulated stop time.
    pub tstop: f64,
    /// Append this window to datasets left by an earlier run instead of
    /// replacing them.
    pub extend_existing: bool,
}

impl RecordingPlan {
    /// Creates a plan.
    pub fn new(total_steps: usize, block_size: usize, dt: f64, tstart: f64, tstop: f64) -> Self {
        Self {
            total_steps,
            block_size,
            dt,
            tstart,
            tstop,
            extend_existing: false,
        }
    }

    /// Same plan, appending to existing datasets.
    pub fn extending(mut self) -> Self {
        self.extend_existing = true;
        self
    }

    fn attrs(&self) -> DatasetAttrs {
        DatasetAttrs {
            dt: self.dt,
            tstart: self.tstart,
            tstop: self.tstop,
        }
    }
}

// =============================================================================
// Block cadence
// =============================================================================

/// Consecutive block ranges covering `[0, total_steps)`.
///
/// Every range has length `block_size` except possibly the last, which has
/// length `total_steps % block_size` when that is nonzero.
///
/// # Examples
///
/// ```rust
/// use simrec_io::recorder::BlockSchedule;
///
/// let blocks: Vec<_> = BlockSchedule::new(100, 30).unwrap().collect();
/// assert_eq!(blocks, vec![0..30, 30..60, 60..90, 90..100]);
/// ```
#[derive(Clone, Debug)]
pub struct BlockSchedule {
    total_steps: usize,
    block_size: usize,
    next: usize,
}

impl BlockSchedule {
    /// Creates the schedule.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::InvalidBlockSize`] for a zero block size.
    pub fn new(total_steps: usize, block_size: usize) -> RecorderResult<Self> {
        if block_size == 0 {
            return Err(RecorderError::InvalidBlockSize(block_size));
        }
        Ok(Self {
            total_steps,
            block_size,
            next: 0,
        })
    }

    /// Total number of blocks, the partial one included.
    pub fn block_count(&self) -> usize {
        self.total_steps.div_ceil(self.block_size)
    }

    /// Block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Iterator for BlockSchedule {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.next >= self.total_steps {
            return None;
        }
        let start = self.next;
        let end = (start + self.block_size).min(self.total_steps);
        self.next = end;
        Some(start..end)
    }
}

// =============================================================================
// Buffers
// =============================================================================

/// Fixed-capacity staging buffer for one (entity, variable).
#[derive(Clone, Debug)]
pub struct SeriesBuffer {
    samples: Vec<f64>,
    offset: usize,
}

impl SeriesBuffer {
    /// Zero-initialised buffer of `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            offset: 0,
        }
    }

    /// Stores `sample` at the write offset; `false` if the buffer is full.
    #[inline]
    pub fn push(&mut self, sample: f64) -> bool {
        match self.samples.get_mut(self.offset) {
            Some(slot) => {
                *slot = sample;
                self.offset += 1;
                true
            }
            None => false,
        }
    }

    /// Current write offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Capacity (block size).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// First `len` staged samples (zero beyond the write offset).
    #[inline]
    pub fn head(&self, len: usize) -> &[f64] {
        &self.samples[..len]
    }

    /// Zeroes the contents and rewinds the write offset.
    pub fn reset(&mut self) {
        self.samples.fill(0.0);
        self.offset = 0;
    }
}

struct EntitySeries {
    writer: DatasetWriter,
    buffers: Vec<SeriesBuffer>,
}

// =============================================================================
// Recorder
// =============================================================================

/// Per-worker recorder of entity time series.
///
/// Owns the datasets and buffers of the entities assigned to its worker;
/// no other worker touches them, so nothing here synchronises.
pub struct TimeSeriesRecorder {
    worker: Worker,
    cell_vars_dir: PathBuf,
    state: RecorderState,
    plan: Option<RecordingPlan>,
    variables: Vec<String>,
    series: BTreeMap<EntityId, EntitySeries>,
    /// Steps staged through [`sample_step`](Self::sample_step) in the current block.
    block_step: usize,
    flushed: Vec<Range<usize>>,
}

impl TimeSeriesRecorder {
    /// Creates an idle recorder writing datasets into `cell_vars_dir`.
    pub fn new(worker: Worker, cell_vars_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker,
            cell_vars_dir: cell_vars_dir.into(),
            state: RecorderState::Idle,
            plan: None,
            variables: Vec::new(),
            series: BTreeMap::new(),
            block_step: 0,
            flushed: Vec::new(),
        }
    }

    /// Entities to record on `worker`: those it owns that are also selected.
    pub fn select_entities(
        worker: &Worker,
        owned: impl IntoIterator<Item = EntityId>,
        selection: &BTreeSet<EntityId>,
    ) -> BTreeSet<EntityId> {
        owned
            .into_iter()
            .filter(|id| worker.owns(*id) && selection.contains(id))
            .collect()
    }

    /// Dataset path of `entity`.
    pub fn dataset_path(&self, entity: EntityId) -> PathBuf {
        dataset_path(&self.cell_vars_dir, entity)
    }

    /// Lifecycle state.
    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Plan given to [`initialize`](Self::initialize), if any.
    pub fn plan(&self) -> Option<&RecordingPlan> {
        self.plan.as_ref()
    }

    /// Ranges flushed so far, in call order.
    pub fn flushed_ranges(&self) -> &[Range<usize>] {
        &self.flushed
    }

    /// All recorded series on this worker.
    pub fn recorded_variables(&self) -> Vec<RecordedVariable> {
        self.series
            .keys()
            .flat_map(|entity| {
                self.variables
                    .iter()
                    .map(move |name| RecordedVariable::new(*entity, name.clone()))
            })
            .collect()
    }

    /// Number of steps staged in the current block and not yet flushed.
    pub fn pending_steps(&self) -> usize {
        self.series
            .values()
            .flat_map(|s| s.buffers.iter().map(SeriesBuffer::offset))
            .fold(self.block_step, usize::max)
    }

    /// Creates datasets and allocates buffers.
    ///
    /// One dataset per entity, sized exactly `plan.total_steps` per variable
    /// and carrying the run metadata; one zeroed buffer of
    /// `plan.block_size` per (entity, variable). With
    /// [`RecordingPlan::extend_existing`] an entity's existing dataset is
    /// grown by `plan.total_steps` instead, and flush ranges address the new
    /// tail.
    ///
    /// # Errors
    ///
    /// - [`RecorderError::NotRecording`] if called twice
    /// - [`RecorderError::InvalidBlockSize`] for a zero block size
    /// - [`RecorderError::Dataset`] if a dataset cannot be created
    pub fn initialize(
        &mut self,
        entities: &BTreeSet<EntityId>,
        variables: &[String],
        plan: RecordingPlan,
    ) -> RecorderResult<()> {
        if self.state != RecorderState::Idle {
            return Err(RecorderError::NotRecording { state: self.state });
        }
        if plan.block_size == 0 {
            return Err(RecorderError::InvalidBlockSize(plan.block_size));
        }

        let mut series = BTreeMap::new();
        for &entity in entities {
            let path = dataset_path(&self.cell_vars_dir, entity);
            let writer = if plan.extend_existing && path.is_file() {
                DatasetWriter::extend(
                    path,
                    plan.attrs(),
                    variables,
                    plan.total_steps,
                    plan.block_size,
                )?
            } else {
                DatasetWriter::create(
                    path,
                    plan.attrs(),
                    variables,
                    plan.total_steps,
                    plan.block_size,
                )?
            };
            let buffers = variables
                .iter()
                .map(|_| SeriesBuffer::new(plan.block_size))
                .collect();
            series.insert(entity, EntitySeries { writer, buffers });
        }

        info!(
            rank = self.worker.rank(),
            entities = series.len(),
            variables = variables.len(),
            total_steps = plan.total_steps,
            block_size = plan.block_size,
            "Recorder initialised"
        );

        self.series = series;
        self.variables = variables.to_vec();
        self.plan = Some(plan);
        self.state = RecorderState::Recording;
        Ok(())
    }

    /// Stages one sample of `variable` on `entity`. Pure in-memory.
    ///
    /// # Errors
    ///
    /// - [`RecorderError::UnknownSeries`] if the pair is not recorded here
    /// - [`RecorderError::BufferFull`] if the block is already complete
    pub fn record_step(&mut self, entity: EntityId, variable: &str, sample: f64) -> RecorderResult<()> {
        self.ensure_recording()?;

        let unknown = || RecorderError::UnknownSeries {
            variable: RecordedVariable::new(entity, variable),
        };
        let index = self
            .variables
            .iter()
            .position(|v| v == variable)
            .ok_or_else(unknown)?;
        let buffer = self
            .series
            .get_mut(&entity)
            .map(|s| &mut s.buffers[index])
            .ok_or_else(unknown)?;

        if !buffer.push(sample) {
            return Err(RecorderError::BufferFull {
                variable: RecordedVariable::new(entity, variable),
                capacity: buffer.capacity(),
            });
        }
        Ok(())
    }

    /// Samples every recorded (entity, variable) once and stages the values.
    pub fn sample_step<S: Sampler + ?Sized>(&mut self, sampler: &S) -> RecorderResult<()> {
        self.ensure_recording()?;
        let block_size = self.block_size();
        if self.pending_steps() >= block_size {
            let variable = self
                .recorded_variables()
                .into_iter()
                .next()
                .unwrap_or_else(|| RecordedVariable::new(EntityId(0), "*"));
            return Err(RecorderError::BufferFull {
                variable,
                capacity: block_size,
            });
        }

        for (&entity, series) in self.series.iter_mut() {
            for (name, buffer) in self.variables.iter().zip(series.buffers.iter_mut()) {
                buffer.push(sampler.sample(entity, name));
            }
        }
        self.block_step += 1;
        Ok(())
    }

    /// Writes staged samples `[0, end - start)` of every buffer to dataset
    /// steps `[start, end)`, then rewinds the buffers.
    ///
    /// An empty range with nothing staged does nothing and is not recorded.
    ///
    /// # Errors
    ///
    /// - [`RecorderError::InvalidRange`] if `start > end`, the range is
    ///   longer than a block, it runs past `total_steps`, or it is empty
    ///   while samples are staged
    /// - [`RecorderError::Dataset`] on write failure
    pub fn flush_block(&mut self, range: Range<usize>) -> RecorderResult<()> {
        self.ensure_recording()?;
        let plan = self.require_plan()?;

        let Range { start, end } = range;
        let pending = self.pending_steps();
        if start > end
            || end - start > plan.block_size
            || end > plan.total_steps
            || (start == end && pending > 0)
        {
            return Err(RecorderError::InvalidRange {
                start,
                end,
                block_size: plan.block_size,
                total_steps: plan.total_steps,
            });
        }

        let len = end - start;
        if len == 0 {
            return Ok(());
        }
        if pending > len {
            warn!(
                rank = self.worker.rank(),
                pending,
                start,
                end,
                "Flushing fewer steps than are staged; the excess is discarded"
            );
        }

        for series in self.series.values_mut() {
            let offset = series.writer.window_start();
            for (index, buffer) in series.buffers.iter_mut().enumerate() {
                series
                    .writer
                    .write_series(index, offset + start, buffer.head(len))?;
                buffer.reset();
            }
        }

        debug!(rank = self.worker.rank(), start, end, "Block flushed");
        self.block_step = 0;
        self.flushed.push(start..end);
        Ok(())
    }

    /// Flushes the trailing partial block, syncs and releases every dataset.
    ///
    /// With `n` steps pending this flushes `[total_steps - n, total_steps)`;
    /// with none pending it flushes nothing. Calling it again is a no-op.
    /// Returns the range flushed, if any.
    pub fn finalize(&mut self, total_steps: usize) -> RecorderResult<Option<Range<usize>>> {
        match self.state {
            RecorderState::Finalised => return Ok(None),
            RecorderState::Idle => {
                return Err(RecorderError::NotRecording { state: self.state });
            }
            RecorderState::Recording => {}
        }

        let pending = self.pending_steps();
        let flushed = if pending > 0 {
            let plan = self.require_plan()?;
            let start = total_steps
                .checked_sub(pending)
                .ok_or(RecorderError::InvalidRange {
                    start: 0,
                    end: total_steps,
                    block_size: plan.block_size,
                    total_steps: plan.total_steps,
                })?;
            self.flush_block(start..total_steps)?;
            Some(start..total_steps)
        } else {
            None
        };

        for series in self.series.values() {
            series.writer.sync()?;
        }
        self.series.clear();
        self.state = RecorderState::Finalised;

        info!(
            rank = self.worker.rank(),
            flushes = self.flushed.len(),
            "Recorder finalised"
        );
        Ok(flushed)
    }

    fn ensure_recording(&self) -> RecorderResult<()> {
        if self.state == RecorderState::Recording {
            Ok(())
        } else {
            Err(RecorderError::NotRecording { state: self.state })
        }
    }

    fn require_plan(&self) -> RecorderResult<RecordingPlan> {
        self.plan
            .ok_or(RecorderError::NotRecording { state: self.state })
    }

    fn block_size(&self) -> usize {
        self.plan.map_or(0, |p| p.block_size)
    }
}

fn dataset_path(dir: &Path, entity: EntityId) -> PathBuf {
    dir.join(format!("{}.{}", entity, DATASET_EXTENSION))
}
