//! Benchmarks for the scheduling hot paths
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use devmux::ops::{Downsampler, SamplePipelineBuilder};
use devmux::{
    Attribute, AttributeType, Operation, Sample, SamplePipeline, Scheduler, Task, TaskHandler,
    Value,
};
use std::sync::Arc;

/// Minimal operation exposing a fixed attribute set, enough for best-fit
struct FixedOperation {
    id: u64,
    attributes: Vec<Attribute>,
}

impl Operation for FixedOperation {
    fn id(&self) -> u64 {
        self.id
    }
    fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }
    fn schedulable(&self) -> bool {
        true
    }
    fn schedule_with_pipeline(
        self: Arc<Self>,
        _params: devmux::ScriptParams,
        _handler: Arc<dyn TaskHandler>,
        _pipeline: SamplePipeline,
    ) -> devmux::Result<Arc<Task>> {
        unreachable!("benchmarks only match, they never schedule")
    }
    fn remove_task(&self, _task: &Arc<Task>) {}
    fn stop(&self, on_stopped: Box<dyn FnOnce(u64) + Send>) {
        on_stopped(self.id)
    }
}

fn attr(i: usize) -> Attribute {
    Attribute::new(format!("attribute_{i}"), AttributeType::Integer)
}

/// Pool of operations exposing overlapping attribute windows
fn pool(operations: usize, width: usize) -> Vec<Arc<dyn Operation>> {
    (0..operations)
        .map(|op| {
            let attributes = (op..op + width).map(attr).collect();
            Arc::new(FixedOperation {
                id: op as u64,
                attributes,
            }) as Arc<dyn Operation>
        })
        .collect()
}

fn bench_best_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("best_fit");

    for size in [10, 100, 1_000] {
        let scheduler = Scheduler::new(pool(size, 4), Vec::new(), Vec::new(), Vec::new());
        let request = vec![attr(size / 2), attr(size / 2 + 1)];

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("relaxed", size), &request, |b, request| {
            b.iter(|| scheduler.get(black_box(request), false))
        });
        group.bench_with_input(BenchmarkId::new("strict", size), &request, |b, request| {
            b.iter(|| scheduler.get(black_box(request), true))
        });
    }
    group.finish();
}

fn bench_downsampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("downsampler");
    group.throughput(Throughput::Elements(1));

    group.bench_function("admit", |b| {
        let mut ds = Downsampler::new(100, 300);
        b.iter(|| black_box(ds.admit()))
    });
    group.bench_function("construct", |b| {
        b.iter(|| Downsampler::new(black_box(100), black_box(314)))
    });
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(1));

    let source: Vec<Attribute> = (0..8).map(attr).collect();
    let sample = Sample::new(
        Arc::new(source.clone()),
        (0..8).map(|i| Value::Integer(i)).collect(),
    );

    let identity = SamplePipeline::identity(Arc::new(source.clone()));
    group.bench_function("identity", |b| b.iter(|| identity.process(black_box(&sample))));

    let decorated = SamplePipelineBuilder::new(&source)
        .add_static(
            Attribute::new("location", AttributeType::String),
            Value::String("lab".to_string()),
        )
        .add_timestamp("sampled_at")
        .build();
    group.bench_function("decorated", |b| b.iter(|| decorated.process(black_box(&sample))));

    let mut reordered_output: Vec<Attribute> = source.clone();
    reordered_output.reverse();
    let reordered = SamplePipelineBuilder::new(&source)
        .build_reordered(&reordered_output)
        .unwrap();
    group.bench_function("reordered", |b| b.iter(|| reordered.process(black_box(&sample))));

    group.finish();
}

criterion_group!(benches, bench_best_fit, bench_downsampler, bench_pipeline);
criterion_main!(benches);
