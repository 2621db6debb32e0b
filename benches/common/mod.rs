use hotpatch::dsp::{PatchCompiler, ProcessSpec};
use hotpatch::node::{self, AudioNode, CompileOrchestrator, HostedNode};
use hotpatch::params::ParameterTree;
use hotpatch::source::DirectorySource;
use std::path::Path;

pub const SAMPLE_RATE: f64 = 48000.0;

/// `count` gain parameters multiplied in series, plus a modulation output.
pub fn gain_chain_source(count: usize) -> String {
    let mut source = String::from("mod\n");
    let mut ops = String::from("process");
    for i in 0..count {
        source.push_str(&format!("param g{i} 0 2 0 1\n"));
        ops.push_str(&format!(" *g{i}"));
    }
    ops.push_str(" clip\n");
    source.push_str(&ops);
    source
}

pub fn compiled_node(
    source_dir: &Path,
    source: &str,
    block_size: usize,
) -> (CompileOrchestrator, AudioNode) {
    let sources = DirectorySource::new(source_dir).unwrap();
    let (orchestrator, mut audio, _) = node::create(
        Box::new(PatchCompiler::new()),
        Box::new(sources),
        ParameterTree::new(),
        Vec::new(),
    );
    audio.prepare(ProcessSpec {
        sample_rate: SAMPLE_RATE,
        block_size,
    });
    orchestrator.recompile("Bench", source, &[]).unwrap();

    (orchestrator, audio)
}
