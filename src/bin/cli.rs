use anyhow::{Context, Result};
use clap::Parser;
use hotpatch::dsp::{PatchCompiler, ProcessSpec};
use hotpatch::node::{self, AudioNode, CompileOrchestrator, HostedNode, ModulationHandle};
use hotpatch::params::ParameterTree;
use hotpatch::settings::Settings;
use hotpatch::source::DirectorySource;
use log::{info, warn};
use std::{
    f32::consts::TAU,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime},
};

const TEST_TONE_HZ: f32 = 220.0;
const WATCH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "hotpatch")]
#[command(version = "0.1")]
#[command(about = "Compiles a DSP patch and keeps its parameters across recompiles.")]
struct Args {
    #[arg(long, env = "HOTPATCH_IDENTITY", help = "Module to compile")]
    identity: String,
    #[arg(long, help = "Create the source from a template if it doesn't exist")]
    create: bool,
    #[arg(
        long,
        env = "HOTPATCH_SOURCE_DIR",
        help = "Directory holding <identity>.dsp sources (overrides settings)"
    )]
    source_dir: Option<String>,
    #[arg(long = "set", value_name = "LABEL=VALUE", help = "Set a parameter after compiling")]
    set: Vec<String>,
    #[arg(long, value_name = "FILE", help = "Render a test tone through the module")]
    render: Option<PathBuf>,
    #[arg(long, default_value_t = 2.0, help = "Length of the render")]
    seconds: f32,
    #[arg(long, help = "Recompile whenever the source changes, until Ctrl+C")]
    watch: bool,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    info!("Hotpatch v{}", env!("CARGO_PKG_VERSION"));
    info!("Args: {:?}", args);

    let mut settings = Settings::load().context("failed to load settings")?;
    if let Some(dir) = &args.source_dir {
        settings.compiler.source_dir.clone_from(dir);
    }
    info!("{settings}");

    let tree_path = PathBuf::from(&settings.tree_path);
    let tree = if tree_path.exists() {
        ParameterTree::load(&tree_path)?
    } else {
        ParameterTree::new()
    };

    let source_dir = PathBuf::from(&settings.compiler.source_dir);
    let sources = DirectorySource::new(&source_dir)?;
    let source_path = sources.source_path(&args.identity);

    let (orchestrator, mut audio, modulation) = node::create(
        Box::new(PatchCompiler::new()),
        Box::new(sources),
        tree,
        settings.compiler.library_paths(),
    );
    let spec = settings.audio.process_spec();
    audio.prepare(spec);

    let outcome = if args.create {
        orchestrator.create_source_and_set_identity(&args.identity)?
    } else {
        orchestrator.request_recompile(&args.identity)
    };
    println!("{}: {outcome}", args.identity);

    apply_settings(&orchestrator, &args.set)?;
    print_tree(&orchestrator);

    if let Some(path) = &args.render {
        render(&mut audio, &modulation, path, args.seconds, spec)?;
        orchestrator.collect_garbage();
    }

    if args.watch {
        watch(&orchestrator, &mut audio, &args.identity, &source_path)?;
    }

    orchestrator
        .save_tree(&tree_path)
        .with_context(|| format!("failed to save parameter tree to {}", tree_path.display()))?;
    Ok(())
}

fn apply_settings(orchestrator: &CompileOrchestrator, assignments: &[String]) -> Result<()> {
    for assignment in assignments {
        let (label, value) = assignment
            .split_once('=')
            .with_context(|| format!("expected LABEL=VALUE, got '{assignment}'"))?;
        let value: f64 = value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for '{label}'"))?;

        match orchestrator.parameter_handle(label.trim()) {
            Some(handle) if handle.set(value) => info!("{label} = {value}"),
            Some(_) => warn!("'{label}' is not bound to the active module"),
            None => warn!("No parameter named '{label}'"),
        }
    }
    Ok(())
}

fn print_tree(orchestrator: &CompileOrchestrator) {
    let registry = orchestrator.registry();
    println!("Parameters:");
    for node in orchestrator.nodes() {
        let value = registry
            .last_value(node.position)
            .unwrap_or(node.range.default);
        println!(
            "  [{}] {} = {} ({}..{}, step {})",
            node.position, node.label, value, node.range.min, node.range.max, node.range.step
        );
    }
    if orchestrator.has_modulation_output() {
        println!("  (modulation output)");
    }
}

fn render(
    audio: &mut AudioNode,
    modulation: &ModulationHandle,
    path: &Path,
    seconds: f32,
    process_spec: ProcessSpec,
) -> Result<()> {
    let sample_rate = process_spec.sample_rate as u32;
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("failed to create {}", path.display()))?;

    let total = (seconds.max(0.0) * sample_rate as f32) as usize;
    let block_size = process_spec.block_size.max(1);
    let mut buffer = vec![0.0f32; block_size];
    let mut phase = 0.0f32;
    let step = TAU * TEST_TONE_HZ / sample_rate as f32;

    let mut written = 0;
    while written < total {
        let frames = block_size.min(total - written);
        let block = &mut buffer[..frames];
        for sample in block.iter_mut() {
            *sample = 0.5 * phase.sin();
            phase = (phase + step) % TAU;
        }

        audio.process_block(block);
        audio.poll_modulation();
        for &sample in block.iter() {
            writer.write_sample((sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)?;
        }
        written += frames;
    }

    writer.finalize().context("failed to finalize render")?;
    info!(
        "Rendered {written} frames to {} ({} modulation updates)",
        path.display(),
        modulation.updates()
    );
    Ok(())
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn watch(
    orchestrator: &CompileOrchestrator,
    audio: &mut AudioNode,
    identity: &str,
    source_path: &Path,
) -> Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    let shutdown_flag = Arc::clone(&running);

    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown_flag.store(false, Ordering::SeqCst);
    })
    .context("error setting Ctrl+C handler")?;

    info!("Watching {}", source_path.display());
    let mut last_modified = modified(source_path);
    let mut silence = vec![0.0f32; 128];

    while running.load(Ordering::SeqCst) {
        thread::sleep(WATCH_INTERVAL);

        // Stand in for the host's processing callback so handed back
        // processors are collected.
        audio.process_block(&mut silence);
        audio.poll_modulation();
        orchestrator.collect_garbage();

        let current = modified(source_path);
        if current == last_modified {
            continue;
        }
        last_modified = current;

        if let Some(outcome) = orchestrator.source_changed(identity) {
            println!("{identity}: {outcome}");
            print_tree(orchestrator);
        }
    }

    info!("Stopped watching");
    Ok(())
}
