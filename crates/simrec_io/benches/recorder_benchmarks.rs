//! Criterion benchmarks for the recorder hot path.
//!
//! Measures in-memory staging of one step across many entities and the cost
//! of flushing a full block to the dataset files.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use simrec_core::{EntityId, Sampler, Worker};
use simrec_io::recorder::{RecordingPlan, TimeSeriesRecorder};
use std::collections::BTreeSet;
use tempfile::TempDir;

const BLOCK_SIZE: usize = 500;

struct LinearSampler;

impl Sampler for LinearSampler {
    fn sample(&self, entity: EntityId, _variable: &str) -> f64 {
        entity.get() as f64 * 0.5
    }
}

/// Recorder with `n_entities` entities and two variables, in a scratch dir.
fn setup_recorder(n_entities: u64) -> (TempDir, TimeSeriesRecorder) {
    let dir = TempDir::new().unwrap();
    let entities: BTreeSet<EntityId> = (0..n_entities).map(EntityId).collect();
    let variables = vec!["v".to_string(), "cai".to_string()];
    let plan = RecordingPlan::new(BLOCK_SIZE * 4, BLOCK_SIZE, 0.1, 0.0, 200.0);

    let mut recorder = TimeSeriesRecorder::new(Worker::solo(), dir.path());
    recorder.initialize(&entities, &variables, plan).unwrap();
    (dir, recorder)
}

/// Benchmark staging of one step (no I/O).
fn bench_sample_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_step");

    for n_entities in [10u64, 100, 1000] {
        let (_dir, mut recorder) = setup_recorder(n_entities);
        group.bench_with_input(
            BenchmarkId::new("entities", n_entities),
            &n_entities,
            |b, _| {
                b.iter(|| {
                    if recorder.pending_steps() == BLOCK_SIZE {
                        recorder.flush_block(0..BLOCK_SIZE).unwrap();
                    }
                    recorder.sample_step(black_box(&LinearSampler)).unwrap();
                });
            },
        );
    }

    group.finish();
}

/// Benchmark a full block: staging plus the flush to disk.
fn bench_full_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_block");
    group.sample_size(20);

    for n_entities in [10u64, 100] {
        let (_dir, mut recorder) = setup_recorder(n_entities);
        group.bench_with_input(
            BenchmarkId::new("entities", n_entities),
            &n_entities,
            |b, _| {
                b.iter(|| {
                    for _ in 0..BLOCK_SIZE {
                        recorder.sample_step(&LinearSampler).unwrap();
                    }
                    recorder.flush_block(black_box(BLOCK_SIZE..2 * BLOCK_SIZE)).unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_sample_step, bench_full_block);
criterion_main!(benches);
