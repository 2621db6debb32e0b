use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use hotpatch::node::HostedNode;
use std::hint::black_box;

mod common;
use common::{compiled_node, gain_chain_source};

fn bench_process_block(c: &mut Criterion) {
    let mut group = c.benchmark_group("Node Processing");
    let dir = std::env::temp_dir().join("hotpatch_bench_sources");

    for &block_size in &[64, 128, 512] {
        group.bench_with_input(
            BenchmarkId::new("8 parameters", block_size),
            &block_size,
            |b, &block_size| {
                let (_orchestrator, mut audio) =
                    compiled_node(&dir, &gain_chain_source(8), block_size);
                let mut buffer = vec![0.5f32; block_size];

                b.iter(|| {
                    audio.process_block(black_box(&mut buffer));
                    black_box(audio.poll_modulation());
                    black_box(&buffer);
                });
            },
        );
    }

    group.finish();
}

fn bench_recompile(c: &mut Criterion) {
    let dir = std::env::temp_dir().join("hotpatch_bench_sources");
    let (orchestrator, mut audio) = compiled_node(&dir, &gain_chain_source(8), 128);
    let sources = [gain_chain_source(8), gain_chain_source(9)];
    let mut buffer = vec![0.5f32; 128];
    let mut next = 0;

    c.bench_function("recompile and swap", |b| {
        b.iter(|| {
            next ^= 1;
            orchestrator
                .recompile("Bench", black_box(&sources[next]), &[])
                .unwrap();
            audio.process_block(&mut buffer);
            audio.poll_modulation();
            orchestrator.collect_garbage();
        });
    });
}

criterion_group!(benches, bench_process_block, bench_recompile);
criterion_main!(benches);
