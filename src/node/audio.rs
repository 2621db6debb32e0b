use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{Receiver, Sender};
use log::{debug, warn};
use std::sync::Arc;

use super::NodeMessage;
use super::modulation::ModulationBridge;
use crate::dsp::{DspProcessor, Event, ProcessSpec};
use crate::params::HolderRegistry;

/// What a host's processing graph needs from a node it owns. The host holds
/// the only strong reference and decides when the node is created, prepared
/// and destroyed.
///
/// Every method is called on the audio thread and must not block or allocate.
pub trait HostedNode {
    fn prepare(&mut self, spec: ProcessSpec);

    fn reset(&mut self);

    fn process_block(&mut self, buffer: &mut [f32]);

    fn process_event(&mut self, event: &Event);

    fn is_processing_events(&self) -> bool;

    /// Called once after each processing unit. Returns the module's new
    /// modulation value, if it published one since the last poll.
    fn poll_modulation(&mut self) -> Option<f64>;
}

struct Installed {
    generation: u64,
    processor: Box<dyn DspProcessor>,
}

/// The audio-thread half of a hot-recompiled module.
///
/// Without an active module (between compiles, after a failed compile) the
/// buffer passes through untouched.
pub struct AudioNode {
    registry: Arc<HolderRegistry>,
    rx_updates: Receiver<NodeMessage>,
    tx_retired: Sender<Box<dyn DspProcessor>>,
    installed: Option<Installed>,
    bridge: ModulationBridge,
    shared_spec: Arc<AtomicCell<Option<ProcessSpec>>>,
    spec: Option<ProcessSpec>,
}

impl AudioNode {
    pub(super) fn new(
        registry: Arc<HolderRegistry>,
        rx_updates: Receiver<NodeMessage>,
        tx_retired: Sender<Box<dyn DspProcessor>>,
        bridge: ModulationBridge,
        shared_spec: Arc<AtomicCell<Option<ProcessSpec>>>,
    ) -> Self {
        Self {
            registry,
            rx_updates,
            tx_retired,
            installed: None,
            bridge,
            shared_spec,
            spec: None,
        }
    }

    pub fn handle_messages(&mut self) {
        while let Ok(message) = self.rx_updates.try_recv() {
            match message {
                NodeMessage::Install {
                    generation,
                    prepared,
                    mut processor,
                } => {
                    if let Some(spec) = self.spec
                        && prepared != Some(spec)
                    {
                        warn!("Processor prepared with a stale spec, preparing on the audio thread");
                        processor.prepare(spec);
                    }

                    debug!("Installed processor for generation {generation}");
                    if let Some(previous) = self.installed.replace(Installed {
                        generation,
                        processor,
                    }) {
                        self.retire(previous);
                    }
                }
                NodeMessage::Retire => {
                    if let Some(previous) = self.installed.take() {
                        self.retire(previous);
                    }
                }
            }
        }
    }

    /// Whether a processor for the active module is installed.
    pub fn is_active(&self) -> bool {
        let live = self.registry.active_generation();
        self.installed
            .as_ref()
            .is_some_and(|i| Some(i.generation) == live)
    }

    pub fn registry(&self) -> &Arc<HolderRegistry> {
        &self.registry
    }

    fn active_processor(&mut self) -> Option<&mut Box<dyn DspProcessor>> {
        let live = self.registry.active_generation()?;
        match &mut self.installed {
            Some(installed) if installed.generation == live => Some(&mut installed.processor),
            _ => None,
        }
    }

    // Hands the processor back so it's dropped off the audio thread.
    fn retire(&self, installed: Installed) {
        if let Err(e) = self.tx_retired.try_send(installed.processor) {
            warn!("Retired processor queue unavailable, dropping on the audio thread");
            drop(e.into_inner());
        }
    }
}

impl HostedNode for AudioNode {
    fn prepare(&mut self, spec: ProcessSpec) {
        debug!(
            "Node prepared: {} Hz, {} frames",
            spec.sample_rate, spec.block_size
        );
        self.spec = Some(spec);
        self.shared_spec.store(Some(spec));

        self.handle_messages();
        if let Some(installed) = self.installed.as_mut() {
            installed.processor.prepare(spec);
        }
    }

    fn reset(&mut self) {
        if let Some(installed) = self.installed.as_mut() {
            installed.processor.reset();
        }
    }

    fn process_block(&mut self, buffer: &mut [f32]) {
        self.handle_messages();

        if let Some(processor) = self.active_processor() {
            processor.process_block(buffer);
        }
    }

    fn process_event(&mut self, event: &Event) {
        self.handle_messages();

        if let Some(processor) = self.active_processor()
            && processor.handles_events()
        {
            processor.handle_event(event);
        }
    }

    fn is_processing_events(&self) -> bool {
        self.is_active()
            && self
                .installed
                .as_ref()
                .is_some_and(|i| i.processor.handles_events())
    }

    fn poll_modulation(&mut self) -> Option<f64> {
        self.bridge.poll(&self.registry)
    }
}
