use crossbeam::atomic::AtomicCell;
use crossbeam::channel::bounded;
use std::path::PathBuf;
use std::sync::Arc;

use crate::dsp::{Compiler, DspProcessor, ProcessSpec};
use crate::params::{HolderRegistry, ParameterTree};
use crate::source::SourceStore;

pub mod audio;
pub mod modulation;
pub mod orchestrator;

pub use audio::{AudioNode, HostedNode};
pub use modulation::{ModulationBridge, ModulationHandle};
pub use orchestrator::{CompileOrchestrator, CompileReport};

const MESSAGE_CAPACITY: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The identity can't name a module. Nothing was touched.
    InvalidIdentity(String),
    /// The source store has nothing for the identity.
    SourceNotFound(String),
    /// The compiler rejected the source; carries its message verbatim.
    CompileFailed(String),
    /// Another compile is still running.
    CompileBusy,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::InvalidIdentity(id) => write!(f, "Invalid name for module: {id}"),
            CompileError::SourceNotFound(id) => write!(f, "No source found for '{id}'"),
            CompileError::CompileFailed(message) => write!(f, "{message}"),
            CompileError::CompileBusy => write!(f, "A compile is already in progress"),
        }
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    NotCompiled,
    Succeeded,
    /// Identity and source matched the active module, nothing was done.
    Unchanged,
    Failed(CompileError),
}

impl CompileOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CompileOutcome::Succeeded | CompileOutcome::Unchanged)
    }
}

impl std::fmt::Display for CompileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileOutcome::NotCompiled => write!(f, "not compiled"),
            CompileOutcome::Succeeded => write!(f, "compiled OK"),
            CompileOutcome::Unchanged => write!(f, "unchanged"),
            CompileOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileState {
    Idle,
    Compiling,
    Active,
    Failed,
}

/// Messages from the compile side to the audio node.
pub enum NodeMessage {
    /// Start processing with `processor` once `generation` is the active one.
    Install {
        generation: u64,
        prepared: Option<ProcessSpec>,
        processor: Box<dyn DspProcessor>,
    },
    /// Hand the current processor back; its module is being replaced.
    Retire,
}

/// Wires an orchestrator to the audio node it feeds.
pub fn create(
    compiler: Box<dyn Compiler>,
    sources: Box<dyn SourceStore>,
    tree: ParameterTree,
    library_paths: Vec<PathBuf>,
) -> (CompileOrchestrator, AudioNode, ModulationHandle) {
    let registry = Arc::new(HolderRegistry::new());
    let (tx_updates, rx_updates) = bounded(MESSAGE_CAPACITY);
    let (tx_retired, rx_retired) = bounded(MESSAGE_CAPACITY);
    let spec = Arc::new(AtomicCell::new(None));
    let (bridge, modulation) = ModulationBridge::new();

    let orchestrator = CompileOrchestrator::new(
        compiler,
        sources,
        tree,
        library_paths,
        Arc::clone(&registry),
        orchestrator::Channels {
            tx_updates,
            rx_pending: rx_updates.clone(),
            rx_retired,
        },
        Arc::clone(&spec),
    );
    let node = AudioNode::new(registry, rx_updates, tx_retired, bridge, spec);

    (orchestrator, node, modulation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_is_ok() {
        assert!(CompileOutcome::Succeeded.is_ok());
        assert!(CompileOutcome::Unchanged.is_ok());
        assert!(!CompileOutcome::NotCompiled.is_ok());
        assert!(!CompileOutcome::Failed(CompileError::CompileBusy).is_ok());
    }

    #[test]
    fn test_compile_failed_displays_message_verbatim() {
        let err = CompileError::CompileFailed("Gain.dsp:3: unknown statement 'x'".to_string());
        assert_eq!(err.to_string(), "Gain.dsp:3: unknown statement 'x'");
    }
}
