use anyhow::Result;
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Instant;

use super::{CompileError, CompileOutcome, CompileState, NodeMessage};
use crate::dsp::{CompiledModule, CompiledParameter, Compiler, DspProcessor, ParameterRange};
use crate::dsp::{ProcessSpec, ZoneTable};
use crate::params::holder::ActiveModule;
use crate::params::{
    ChangeCallback, HolderRegistry, ParameterHandle, ParameterNode, ParameterTree, TreeListener,
    sync,
};
use crate::source::SourceStore;

pub(super) struct Channels {
    pub tx_updates: Sender<NodeMessage>,
    // Second receiver on the update channel, used to discard stale messages
    // the audio node hasn't picked up yet.
    pub rx_pending: Receiver<NodeMessage>,
    pub rx_retired: Receiver<Box<dyn DspProcessor>>,
}

/// What a successful `recompile` changed in the parameter tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub unchanged: bool,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

struct ActiveRecord {
    identity: String,
    source: String,
    parameters: Vec<CompiledParameter>,
    has_modulation: bool,
}

struct Inner {
    tree: ParameterTree,
    identity: String,
    active: Option<ActiveRecord>,
    outcome: CompileOutcome,
    generation: u64,
    on_change: Option<ChangeCallback>,
}

// Keeps holders' capacity in step with the tree and leaves the holder of a
// removed node inert.
struct HolderMaintenance {
    registry: Arc<HolderRegistry>,
}

impl TreeListener for HolderMaintenance {
    fn node_added(&mut self, node: &ParameterNode) {
        self.registry.ensure_capacity(node.position + 1);
    }

    fn node_removed(&mut self, node: &ParameterNode) {
        debug!("Removing parameter: {}", node.label);
        if let Err(e) = self.registry.unbind(node.position) {
            error!("Removed node '{}' had no holder: {e}", node.label);
        }
    }
}

/// Sequences recompiles and owns the host parameter tree.
///
/// All methods take `&self`; share it behind an `Arc` between the UI and file
/// watcher threads. None of them may be called from the audio thread.
pub struct CompileOrchestrator {
    compiler: Box<dyn Compiler>,
    sources: Box<dyn SourceStore>,
    library_paths: Vec<PathBuf>,
    registry: Arc<HolderRegistry>,
    state: AtomicCell<CompileState>,
    inner: Mutex<Inner>,
    channels: Channels,
    spec: Arc<AtomicCell<Option<ProcessSpec>>>,
}

// Marks the orchestrator as compiling until finished or dropped.
fn outcome(result: Result<CompileReport, CompileError>) -> CompileOutcome {
    match result {
        Ok(report) if report.unchanged => CompileOutcome::Unchanged,
        Ok(_) => CompileOutcome::Succeeded,
        Err(e) => CompileOutcome::Failed(e),
    }
}

struct Busy<'a> {
    state: &'a AtomicCell<CompileState>,
    previous: CompileState,
    done: bool,
}

impl Busy<'_> {
    fn finish(mut self, state: CompileState) {
        self.state.store(state);
        self.done = true;
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        if !self.done {
            let state = if thread::panicking() {
                CompileState::Failed
            } else {
                self.previous
            };
            self.state.store(state);
        }
    }
}

impl CompileOrchestrator {
    pub(super) fn new(
        compiler: Box<dyn Compiler>,
        sources: Box<dyn SourceStore>,
        mut tree: ParameterTree,
        library_paths: Vec<PathBuf>,
        registry: Arc<HolderRegistry>,
        channels: Channels,
        spec: Arc<AtomicCell<Option<ProcessSpec>>>,
    ) -> Self {
        registry.ensure_capacity(tree.next_position());
        tree.add_listener(Box::new(HolderMaintenance {
            registry: Arc::clone(&registry),
        }));

        Self {
            compiler,
            sources,
            library_paths,
            registry,
            state: AtomicCell::new(CompileState::Idle),
            inner: Mutex::new(Inner {
                tree,
                identity: String::new(),
                active: None,
                outcome: CompileOutcome::NotCompiled,
                generation: 0,
                on_change: None,
            }),
            channels,
            spec,
        }
    }

    /// Compiles `source` as `identity` and makes it the active module. On
    /// success `identity` becomes the current identity, without clearing the
    /// tree.
    pub fn recompile(
        &self,
        identity: &str,
        source: &str,
        library_paths: &[PathBuf],
    ) -> Result<CompileReport, CompileError> {
        self.validate(identity)?;
        let busy = self.begin()?;
        self.run(busy, identity, source, library_paths)
    }

    /// Loads the source for `identity` from the store and recompiles it with
    /// the configured library paths. Switching to a different identity first
    /// removes every node of the previous one from the tree; a missing source
    /// changes nothing.
    pub fn request_recompile(&self, identity: &str) -> CompileOutcome {
        let result = self.validate(identity).and_then(|()| {
            let busy = self.begin()?;
            let Some(source) = self.sources.load_source(identity) else {
                warn!("Could not load source for '{identity}'");
                return Err(CompileError::SourceNotFound(identity.to_string()));
            };

            self.switch_identity(identity);
            self.run(busy, identity, &source, &self.library_paths)
        });

        outcome(result)
    }

    /// Makes `identity` the current one and compiles its source from the
    /// store. A different identity removes every node of the previous one
    /// from the tree, even when the store has no source for it; the active
    /// module then keeps running until the next successful compile.
    pub fn set_identity(&self, identity: &str) -> CompileOutcome {
        let result = self.validate(identity).and_then(|()| {
            let busy = self.begin()?;
            self.switch_identity(identity);
            let Some(source) = self.sources.load_source(identity) else {
                warn!("No source for '{identity}' yet");
                return Err(CompileError::SourceNotFound(identity.to_string()));
            };
            self.run(busy, identity, &source, &self.library_paths)
        });
        outcome(result)
    }

    /// Notification from the source store that `identity` changed. Only the
    /// current identity is recompiled.
    pub fn source_changed(&self, identity: &str) -> Option<CompileOutcome> {
        if self.inner().identity != identity {
            return None;
        }
        Some(self.request_recompile(identity))
    }

    pub fn create_source_and_set_identity(&self, identity: &str) -> Result<CompileOutcome> {
        if let Err(e) = self.validate(identity) {
            return Ok(CompileOutcome::Failed(e));
        }
        self.sources.create_source(identity)?;
        Ok(self.set_identity(identity))
    }

    /// The outcome of the last compile that actually ran.
    pub fn current_compile_result(&self) -> CompileOutcome {
        self.inner().outcome.clone()
    }

    pub fn list_available_identities(&self) -> Vec<String> {
        self.sources.list_identities()
    }

    pub fn state(&self) -> CompileState {
        self.state.load()
    }

    pub fn identity(&self) -> String {
        self.inner().identity.clone()
    }

    pub fn library_paths(&self) -> &[PathBuf] {
        &self.library_paths
    }

    pub fn registry(&self) -> &Arc<HolderRegistry> {
        &self.registry
    }

    pub fn has_modulation_output(&self) -> bool {
        self.inner()
            .active
            .as_ref()
            .is_some_and(|a| a.has_modulation)
    }

    /// Zones of the module holders currently forward into.
    pub fn active_zones(&self) -> Option<Arc<ZoneTable>> {
        let table = self.registry.load();
        table.active().map(|a| Arc::clone(&a.zones))
    }

    /// Takes effect for bindings made from now on.
    pub fn set_change_callback(&self, callback: Option<ChangeCallback>) {
        self.inner().on_change = callback;
    }

    pub fn add_tree_listener(&self, listener: Box<dyn TreeListener>) {
        self.inner().tree.add_listener(listener);
    }

    pub fn nodes(&self) -> Vec<ParameterNode> {
        self.inner().tree.nodes().to_vec()
    }

    pub fn with_tree<R>(&self, f: impl FnOnce(&ParameterTree) -> R) -> R {
        f(&self.inner().tree)
    }

    pub fn save_tree(&self, path: &Path) -> Result<()> {
        self.inner().tree.save(path)
    }

    pub fn parameter_handle(&self, label: &str) -> Option<ParameterHandle> {
        let position = self.inner().tree.get(label)?.position;
        Some(self.registry.handle(position))
    }

    /// Host-side structural edit: appends a node, binding it right away when
    /// the active module declares the label. An existing label is left as is.
    pub fn add_parameter(&self, label: &str, range: ParameterRange) -> usize {
        let mut inner = self.inner();
        if let Some(existing) = inner.tree.get(label) {
            return existing.position;
        }

        let position = inner.tree.add(label, range);
        Self::bind_node(&self.registry, &inner, label, position, range);
        position
    }

    pub fn remove_parameter(&self, label: &str) -> bool {
        self.inner().tree.remove(label).is_some()
    }

    /// Host-side range customisation. Rebinds the holder so the new range
    /// applies immediately.
    pub fn set_parameter_range(&self, label: &str, range: ParameterRange) -> bool {
        let mut inner = self.inner();
        if !inner.tree.set_range(label, range) {
            return false;
        }

        if let Some(position) = inner.tree.get(label).map(|n| n.position) {
            Self::bind_node(&self.registry, &inner, label, position, range);
        }
        true
    }

    /// Drops processors the audio node handed back.
    pub fn collect_garbage(&self) {
        let retired = self.channels.rx_retired.try_iter().count();
        if retired > 0 {
            debug!("Dropped {retired} retired processor(s)");
        }
    }

    fn validate(&self, identity: &str) -> Result<(), CompileError> {
        if self.compiler.is_valid_identity(identity) {
            Ok(())
        } else {
            error!("Invalid name for module: {identity}");
            Err(CompileError::InvalidIdentity(identity.to_string()))
        }
    }

    fn begin(&self) -> Result<Busy<'_>, CompileError> {
        let previous = self.state.load();
        if previous == CompileState::Compiling
            || self
                .state
                .compare_exchange(previous, CompileState::Compiling)
                .is_err()
        {
            warn!("Compile requested while another is running");
            return Err(CompileError::CompileBusy);
        }

        Ok(Busy {
            state: &self.state,
            previous,
            done: false,
        })
    }

    fn switch_identity(&self, identity: &str) {
        let mut inner = self.inner();
        if inner.identity == identity {
            return;
        }

        // A different module: its parameters have nothing to do with ours.
        if !inner.identity.is_empty() {
            debug!(
                "Switching from '{}' to '{}', clearing parameters",
                inner.identity, identity
            );
            inner.tree.clear();
        }
        inner.identity = identity.to_string();
    }

    fn run(
        &self,
        busy: Busy<'_>,
        identity: &str,
        source: &str,
        library_paths: &[PathBuf],
    ) -> Result<CompileReport, CompileError> {
        if self.is_current(identity, source) {
            debug!("'{identity}' is unchanged, skipping compile");
            let previous = busy.previous;
            busy.finish(previous);
            return Ok(CompileReport {
                unchanged: true,
                ..CompileReport::default()
            });
        }

        self.collect_garbage();
        self.detach();

        let started = Instant::now();
        match self.compiler.compile(identity, source, library_paths) {
            Ok(module) => {
                let report = self.activate(identity, source, module);
                info!(
                    "'{identity}' compiled OK in {:?} (+{} -{} parameters)",
                    started.elapsed(),
                    report.added.len(),
                    report.removed.len()
                );
                busy.finish(CompileState::Active);
                Ok(report)
            }
            Err(message) => {
                error!("{message}");
                let err = CompileError::CompileFailed(message);
                self.inner().outcome = CompileOutcome::Failed(err.clone());
                busy.finish(CompileState::Failed);
                Err(err)
            }
        }
    }

    fn is_current(&self, identity: &str, source: &str) -> bool {
        self.inner()
            .active
            .as_ref()
            .is_some_and(|a| a.identity == identity && a.source == source)
    }

    // From here on no holder reaches the old module and the audio node stops
    // using its processor.
    fn detach(&self) {
        self.registry.unbind_all();
        self.send(NodeMessage::Retire);
        self.inner().active = None;
    }

    fn activate(&self, identity: &str, source: &str, module: CompiledModule) -> CompileReport {
        let (parameters, zones, mut processor) = module.into_parts();
        let has_modulation = zones.modulation().is_some();

        let mut inner = self.inner();
        inner.generation += 1;
        let generation = inner.generation;

        let plan = sync::reconcile(inner.tree.nodes(), &parameters);
        self.registry
            .ensure_capacity(inner.tree.next_position() + plan.to_add.len());
        plan.apply(&mut inner.tree);

        let bindings = sync::bindings(
            inner.tree.nodes(),
            &parameters,
            generation,
            inner.on_change.as_ref(),
        );

        let prepared = self.spec.load();
        if let Some(spec) = prepared {
            processor.prepare(spec);
        }
        self.send(NodeMessage::Install {
            generation,
            prepared,
            processor,
        });

        if let Err(e) = self
            .registry
            .activate(ActiveModule { generation, zones }, bindings)
        {
            error!("Holder registry out of step with the parameter tree: {e}");
            debug_assert!(false, "{e}");
        }

        inner.active = Some(ActiveRecord {
            identity: identity.to_string(),
            source: source.to_string(),
            parameters,
            has_modulation,
        });
        inner.outcome = CompileOutcome::Succeeded;
        identity.clone_into(&mut inner.identity);

        CompileReport {
            unchanged: false,
            added: plan.to_add.into_iter().map(|n| n.label).collect(),
            removed: plan.to_remove,
        }
    }

    fn bind_node(
        registry: &HolderRegistry,
        inner: &Inner,
        label: &str,
        position: usize,
        range: ParameterRange,
    ) {
        let Some(parameter) = inner
            .active
            .as_ref()
            .and_then(|a| a.parameters.iter().find(|p| p.label == label))
        else {
            return;
        };

        if let Err(e) = registry.bind(position, parameter.zone, range, inner.on_change.clone()) {
            error!("Holder registry out of step with the parameter tree: {e}");
            debug_assert!(false, "{e}");
        }
    }

    fn send(&self, message: NodeMessage) {
        // Anything still queued is superseded by this message.
        let stale = self.channels.rx_pending.try_iter().count();
        if stale > 0 {
            debug!("Discarded {stale} undelivered node message(s)");
        }

        match self.channels.tx_updates.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Audio node message queue is full"),
            Err(TrySendError::Disconnected(_)) => debug!("Audio node is gone"),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
