use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

mod common;
use common::{compiled_node, gain_chain_source};

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("Holder Forwarding");
    let dir = std::env::temp_dir().join("hotpatch_bench_sources");

    for &count in &[1, 16, 128] {
        group.bench_with_input(BenchmarkId::new("forward", count), &count, |b, &count| {
            let (orchestrator, _audio) = compiled_node(&dir, &gain_chain_source(count), 128);
            let registry = orchestrator.registry();
            let mut value = 0.0;

            b.iter(|| {
                value = if value > 2.0 { 0.0 } else { value + 0.01 };
                for index in 0..count {
                    black_box(registry.forward(black_box(index), value));
                }
            });
        });
    }

    group.finish();
}

fn bench_load(c: &mut Criterion) {
    let dir = std::env::temp_dir().join("hotpatch_bench_sources");
    let (orchestrator, _audio) = compiled_node(&dir, &gain_chain_source(16), 128);
    let registry = orchestrator.registry();

    c.bench_function("table load", |b| {
        b.iter(|| black_box(registry.load().active().is_some()));
    });
}

criterion_group!(benches, bench_forward, bench_load);
criterion_main!(benches);
