use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use trace_replay::{
    AnalysisPass, Allocator, Device, OperatorRegistry, ReplayEngine, ReplayOptions, SkipPolicy,
    TensorKey, Trace, TraceNode,
};

// =====================================================================
// Synthetic traces
// =====================================================================

/// Alternating relu/sigmoid chain over `width`-element tensors
fn chain_trace(length: u64, width: usize) -> Trace {
    let key = |id: u64| TensorKey::new(id, id, 0, width as u64, 4);
    let mut root = TraceNode::label(0, "## forward ##");
    for step in 1..=length {
        let name = if step % 2 == 0 { "aten::sigmoid" } else { "aten::relu" };
        root = root.child(
            TraceNode::operator(step, name)
                .input_tensor(key(step), &[width], "float")
                .output_tensor(key(step + 1), &[width], "float"),
        );
    }
    Trace::new(root)
}

fn options() -> ReplayOptions {
    ReplayOptions::new()
        .set_warmup_iterations(0)
        .set_iterations(1)
        .set_device(Device::Cpu)
}

// =====================================================================
// Criterion Benchmark Functions
// =====================================================================

fn preprocessing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("preprocessing");
    let registry = OperatorRegistry::initialize_standard_operators();
    let policy = SkipPolicy::default();
    let device = Device::Cpu;

    for length in [100u64, 1000] {
        let trace = chain_trace(length, 256);
        group.bench_function(BenchmarkId::new("analyze_and_allocate", length), |b| {
            b.iter(|| {
                let plan = AnalysisPass::new(&policy, &registry).run(&trace).unwrap();
                Allocator::new(&device, 0).allocate(&plan).unwrap()
            });
        });
    }

    group.finish();
}

fn iteration_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay_iteration");

    for width in [64usize, 4096] {
        let trace = chain_trace(200, width);
        let mut engine = ReplayEngine::new(&trace, options()).unwrap();
        engine.prepare().unwrap();

        group.bench_function(BenchmarkId::new("chain_200", width), |b| {
            b.iter(|| {
                let mut registry = engine.acquire_registry().unwrap();
                engine.execute_iteration(&mut registry).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, preprocessing_benchmark, iteration_benchmark);
criterion_main!(benches);
