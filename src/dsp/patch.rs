//! Reference compiler for the line-oriented patch language.
//!
//! ```text
//! # comments start with '#' or '//'
//! import shared                    # inlines shared.lib from the library paths
//! param gain 0 2 0.01 1            # label min max step default
//! toggle mute
//! mod                              # block peak becomes the modulation output
//! midi gate                        # note events drive the 'gate' parameter
//! process *gain *gate clip
//! ```

use log::debug;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use super::compiler::Compiler;
use super::{
    CompiledModule, CompiledParameter, DspProcessor, Event, ParameterRange, ProcessSpec, ZoneId,
    ZoneTable,
};

const MAX_IMPORT_DEPTH: usize = 8;
const MODULATION_THRESHOLD: f64 = 0.001;
const DEFAULT_GATE_LABEL: &str = "gate";

#[derive(Debug, Default, Clone, Copy)]
pub struct PatchCompiler;

impl PatchCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl Compiler for PatchCompiler {
    fn compile(
        &self,
        identity: &str,
        source: &str,
        library_paths: &[PathBuf],
    ) -> Result<CompiledModule, String> {
        let mut statements = Vec::new();
        let mut imports = Vec::new();
        collect_statements(
            &format!("{identity}.dsp"),
            source,
            library_paths,
            &mut imports,
            &mut statements,
        )?;

        let module = Patch::from_statements(&statements)?.build();
        debug!(
            "Compiled patch '{}' with {} parameters",
            identity,
            module.list_parameters().len()
        );
        Ok(module)
    }
}

struct Statement {
    origin: String,
    tokens: Vec<String>,
}

impl Statement {
    fn error(&self, message: impl std::fmt::Display) -> String {
        format!("{}: {}", self.origin, message)
    }

    fn expect_args(&self, allowed: std::ops::RangeInclusive<usize>) -> Result<&[String], String> {
        let args = &self.tokens[1..];
        if allowed.contains(&args.len()) {
            Ok(args)
        } else if allowed.start() == allowed.end() {
            Err(self.error(format!(
                "'{}' expects {} argument(s), found {}",
                self.tokens[0],
                allowed.start(),
                args.len()
            )))
        } else {
            Err(self.error(format!(
                "'{}' expects {} to {} arguments, found {}",
                self.tokens[0],
                allowed.start(),
                allowed.end(),
                args.len()
            )))
        }
    }

    fn number(&self, token: &str) -> Result<f64, String> {
        token
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| self.error(format!("expected a number, found '{token}'")))
    }
}

fn strip_comment(line: &str) -> &str {
    let end = [line.find('#'), line.find("//")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    &line[..end]
}

fn collect_statements(
    file: &str,
    source: &str,
    library_paths: &[PathBuf],
    imports: &mut Vec<String>,
    out: &mut Vec<Statement>,
) -> Result<(), String> {
    for (index, raw) in source.lines().enumerate() {
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }

        let statement = Statement {
            origin: format!("{file}:{}", index + 1),
            tokens: text.split_whitespace().map(str::to_string).collect(),
        };

        if statement.tokens[0] != "import" {
            out.push(statement);
            continue;
        }

        let name = statement.expect_args(1..=1)?[0].clone();
        if imports.contains(&name) {
            return Err(statement.error(format!("cyclic import of '{name}'")));
        }
        if imports.len() >= MAX_IMPORT_DEPTH {
            return Err(statement.error("imports nested too deeply"));
        }

        let lib_file = format!("{name}.lib");
        let Some(path) = library_paths
            .iter()
            .map(|dir| dir.join(&lib_file))
            .find(|p| p.is_file())
        else {
            return Err(statement.error(format!("library '{lib_file}' not found")));
        };

        let text = fs::read_to_string(&path)
            .map_err(|e| statement.error(format!("failed to read {}: {e}", path.display())))?;

        imports.push(name);
        collect_statements(&lib_file, &text, library_paths, imports, out)?;
        imports.pop();
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Identity,
    Mul(ZoneId),
    Add(ZoneId),
    Clip,
}

#[derive(Default)]
struct Patch {
    parameters: Vec<CompiledParameter>,
    modulation: bool,
    gate: Option<ZoneId>,
    handles_events: bool,
    ops: Option<Vec<Op>>,
}

impl Patch {
    fn from_statements(statements: &[Statement]) -> Result<Self, String> {
        let mut patch = Patch::default();

        // Declarations first so ops and the gate may name parameters declared later.
        for st in statements {
            match st.tokens[0].as_str() {
                "param" => {
                    let args = st.expect_args(5..=5)?;
                    let range = ParameterRange::new(
                        st.number(&args[1])?,
                        st.number(&args[2])?,
                        st.number(&args[3])?,
                        st.number(&args[4])?,
                    );
                    if range.min > range.max {
                        return Err(st.error(format!(
                            "min {} is greater than max {}",
                            range.min, range.max
                        )));
                    }
                    if range.step < 0.0 {
                        return Err(st.error("step must not be negative"));
                    }
                    if !(range.min..=range.max).contains(&range.default) {
                        return Err(st.error(format!(
                            "default {} is outside {}..{}",
                            range.default, range.min, range.max
                        )));
                    }
                    patch.declare(st, &args[0], range)?;
                }
                "toggle" => {
                    let args = st.expect_args(1..=1)?;
                    patch.declare(st, &args[0], ParameterRange::toggle())?;
                }
                "mod" => {
                    st.expect_args(0..=0)?;
                    patch.modulation = true;
                }
                "midi" | "process" => {}
                other => return Err(st.error(format!("unknown statement '{other}'"))),
            }
        }

        for st in statements {
            match st.tokens[0].as_str() {
                "midi" => {
                    let args = st.expect_args(0..=1)?;
                    let label = args.first().map_or(DEFAULT_GATE_LABEL, String::as_str);
                    let zone = patch.lookup(label).ok_or_else(|| {
                        st.error(format!("midi gate '{label}' is not a declared parameter"))
                    })?;
                    patch.gate = Some(zone);
                    patch.handles_events = true;
                }
                "process" => {
                    if patch.ops.is_some() {
                        return Err(st.error("'process' declared more than once"));
                    }
                    let args = &st.tokens[1..];
                    if args.is_empty() {
                        return Err(st.error("'process' needs at least one operation"));
                    }
                    let ops = args
                        .iter()
                        .map(|token| patch.parse_op(st, token))
                        .collect::<Result<Vec<_>, _>>()?;
                    patch.ops = Some(ops);
                }
                _ => {}
            }
        }

        if patch.ops.is_none() {
            return Err("missing 'process' statement".to_string());
        }

        Ok(patch)
    }

    fn declare(&mut self, st: &Statement, label: &str, range: ParameterRange) -> Result<(), String> {
        if self.lookup(label).is_some() {
            return Err(st.error(format!("duplicate parameter label '{label}'")));
        }

        self.parameters.push(CompiledParameter {
            label: label.to_string(),
            range,
            zone: ZoneId(self.parameters.len()),
        });
        Ok(())
    }

    fn lookup(&self, label: &str) -> Option<ZoneId> {
        self.parameters
            .iter()
            .find(|p| p.label == label)
            .map(|p| p.zone)
    }

    fn parse_op(&self, st: &Statement, token: &str) -> Result<Op, String> {
        let zone_for = |label: &str| {
            self.lookup(label)
                .ok_or_else(|| st.error(format!("unknown parameter '{label}'")))
        };

        match token {
            "_" => Ok(Op::Identity),
            "clip" => Ok(Op::Clip),
            t if t.starts_with('*') => zone_for(&t[1..]).map(Op::Mul),
            t if t.starts_with('+') => zone_for(&t[1..]).map(Op::Add),
            t => Err(st.error(format!("unknown operation '{t}'"))),
        }
    }

    fn build(self) -> CompiledModule {
        let initial: Vec<f32> = self
            .parameters
            .iter()
            .map(|p| p.range.default as f32)
            .collect();
        let zones = Arc::new(ZoneTable::new(&initial, self.modulation));

        let processor = PatchProcessor {
            zones: Arc::clone(&zones),
            ops: self.ops.unwrap_or_default(),
            gate: self.gate,
            handles_events: self.handles_events,
            last_modulation: 0.0,
        };

        CompiledModule::new(self.parameters, zones, Box::new(processor))
    }
}

struct PatchProcessor {
    zones: Arc<ZoneTable>,
    ops: Vec<Op>,
    gate: Option<ZoneId>,
    handles_events: bool,
    last_modulation: f64,
}

impl DspProcessor for PatchProcessor {
    fn prepare(&mut self, spec: ProcessSpec) {
        debug!(
            "Patch prepared at {} Hz, {} frames",
            spec.sample_rate, spec.block_size
        );
        self.reset();
    }

    fn reset(&mut self) {
        self.last_modulation = 0.0;
    }

    fn process_block(&mut self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            let mut v = *sample;
            for op in &self.ops {
                v = match *op {
                    Op::Identity => v,
                    Op::Mul(zone) => v * self.zones.value(zone),
                    Op::Add(zone) => v + self.zones.value(zone),
                    Op::Clip => v.clamp(-1.0, 1.0),
                };
            }
            *sample = v;
        }

        if let Some(modulation) = self.zones.modulation() {
            let peak = buffer.iter().fold(0.0f32, |m, s| m.max(s.abs())) as f64;
            if (peak - self.last_modulation).abs() > MODULATION_THRESHOLD {
                self.last_modulation = peak;
                modulation.publish(peak);
            }
        }
    }

    fn handle_event(&mut self, event: &Event) {
        let Some(zone) = self.gate.and_then(|id| self.zones.zone(id)) else {
            return;
        };

        match *event {
            Event::NoteOn { velocity, .. } => zone.set(velocity as f32 / 127.0),
            Event::NoteOff { .. } => zone.set(0.0),
            Event::Controller { .. } => {}
        }
    }

    fn handles_events(&self) -> bool {
        self.handles_events
    }
}
