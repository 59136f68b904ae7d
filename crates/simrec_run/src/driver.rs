//! Run driver: directory preparation, the step loop, block flushes,
//! finalisation and checkpointing, in that order.

use crate::config::RunConfig;
use crate::error::{RunError, RunResult};
use crate::logging::{leader_milestone, run_subscriber};
use simrec_core::coordinator::thread_group;
use simrec_core::{Coordinator, Engine, EntityId, Worker};
use simrec_io::checkpoint::{CheckpointManager, CheckpointRecord};
use simrec_io::output_dir::OutputDirectoryManager;
use simrec_io::recorder::{BlockSchedule, TimeSeriesRecorder};
use std::ops::Range;
use std::path::PathBuf;
use std::thread;
use tracing::{debug, info, info_span};

/// What one worker did during a run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Worker that produced this summary.
    pub worker: Worker,
    /// Steps advanced and recorded.
    pub total_steps: usize,
    /// Entities recorded on this worker.
    pub recorded_entities: Vec<EntityId>,
    /// Flushed ranges in order, the final partial block included.
    pub flushed_ranges: Vec<Range<usize>>,
    /// Whether the run started from a checkpoint.
    pub resumed: bool,
    /// Checkpoint written at the end, if `run.save_state` is set.
    pub checkpoint: Option<CheckpointRecord>,
    /// Dataset directory.
    pub cell_vars_dir: PathBuf,
}

/// Drives one worker through a run.
///
/// Every worker of the group runs its own driver with the same
/// configuration; the directory preparation is the only collective step.
pub struct Driver<'c, C: Coordinator + ?Sized> {
    coordinator: &'c C,
    config: RunConfig,
}

impl<'c, C: Coordinator + ?Sized> Driver<'c, C> {
    /// Creates a driver.
    pub fn new(coordinator: &'c C, config: RunConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs `engine` for `total_steps` steps, recording the selected
    /// entities it owns.
    ///
    /// With `run.start_from_state` the existing output tree is reused, the
    /// worker's checkpoint applied before the first step, and the new window
    /// appended to the datasets already in `cellvars/`.
    ///
    /// Once the output tree is ready the worker's
    /// [`run_subscriber`] is the thread's default until the run returns, so
    /// the leader's events land in the run log file.
    pub fn run<E>(&self, engine: &mut E) -> RunResult<RunSummary>
    where
        E: Engine + ?Sized,
    {
        let config = &self.config;
        config.validate()?;

        let worker = self.coordinator.worker();
        let resumed = config.run.start_from_state;
        let mut manager = OutputDirectoryManager::new(self.coordinator, config.layout());
        let output = if resumed {
            manager.prepare_resume()?
        } else {
            manager = manager.with_config_snapshot(config.snapshot()?);
            manager.prepare(config.run.overwrite_output_dir)?
        };

        let _log = tracing::subscriber::set_default(run_subscriber(
            &worker,
            Some(output.log_file()),
            config.run.log_level,
        )?);
        let span = info_span!("run", rank = worker.rank());
        let _guard = span.enter();
        leader_milestone(
            &worker,
            &format!("Output directory {} ready", output.root().display()),
        );

        let mut checkpoints = CheckpointManager::new(output.state_dir());
        if resumed {
            let record = checkpoints.load(&worker)?;
            checkpoints.restore(&worker, engine, &record)?;
            leader_milestone(&worker, "Restored engine state from checkpoint");
        }

        let plan = config.recording_plan();
        let entities = TimeSeriesRecorder::select_entities(
            &worker,
            engine.entities(),
            &config.node_id_selections.save_cell_vars,
        );
        let mut recorder = TimeSeriesRecorder::new(worker, output.cell_vars_dir());
        recorder.initialize(&entities, &config.run.save_cell_vars, plan)?;

        leader_milestone(
            &worker,
            &format!(
                "Running {} steps (dt = {}, block = {})",
                plan.total_steps, plan.dt, plan.block_size
            ),
        );
        for block in BlockSchedule::new(plan.total_steps, plan.block_size)? {
            for _ in block.clone() {
                engine.advance();
                recorder.sample_step(&*engine)?;
            }
            // The trailing partial block is left to finalize.
            if block.len() == plan.block_size {
                debug!(start = block.start, end = block.end, "Block complete");
                recorder.flush_block(block)?;
            }
        }
        recorder.finalize(plan.total_steps)?;

        let checkpoint = if config.run.save_state {
            Some(checkpoints.save(&worker, &*engine)?)
        } else {
            None
        };

        info!(
            entities = entities.len(),
            flushes = recorder.flushed_ranges().len(),
            "Worker finished"
        );
        leader_milestone(&worker, "Simulation completed");

        Ok(RunSummary {
            worker,
            total_steps: plan.total_steps,
            recorded_entities: entities.into_iter().collect(),
            flushed_ranges: recorder.flushed_ranges().to_vec(),
            resumed,
            checkpoint,
            cell_vars_dir: output.cell_vars_dir().to_path_buf(),
        })
    }
}

/// Runs a whole group of `group_size` workers inside this process, one
/// thread per worker.
///
/// Engines are built up front, one per worker, so that a failing engine
/// construction cannot leave other workers waiting in the collective
/// preparation. Returns every worker's result in rank order.
pub fn run_thread_group<E, F>(
    config: &RunConfig,
    group_size: usize,
    mut make_engine: F,
) -> RunResult<Vec<RunResult<RunSummary>>>
where
    E: Engine + Send,
    F: FnMut(&Worker) -> RunResult<E>,
{
    let coordinators = thread_group(group_size)?;
    let mut engines = coordinators
        .iter()
        .map(|coordinator| make_engine(&coordinator.worker()))
        .collect::<RunResult<Vec<E>>>()?;

    thread::scope(|scope| {
        let handles: Vec<_> = coordinators
            .iter()
            .zip(engines.iter_mut())
            .map(|(coordinator, engine)| {
                scope.spawn(move || Driver::new(coordinator, config.clone()).run(engine))
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| handle.join().map_err(|_| RunError::WorkerPanicked { rank }))
            .collect()
    })
}
