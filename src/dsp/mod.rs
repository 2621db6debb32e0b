use crossbeam::atomic::AtomicCell;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub mod compiler;
pub mod event;
pub mod patch;

pub use compiler::Compiler;
pub use event::Event;
pub use patch::PatchCompiler;

/// Sample rate and maximum block size handed to a module before processing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSpec {
    pub sample_rate: f64,
    pub block_size: usize,
}

impl Default for ProcessSpec {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 128,
        }
    }
}

/// Numeric range of a parameter, in parameter units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub default: f64,
}

impl ParameterRange {
    pub fn new(min: f64, max: f64, step: f64, default: f64) -> Self {
        Self {
            min,
            max,
            step,
            default,
        }
    }

    pub fn toggle() -> Self {
        Self::new(0.0, 1.0, 1.0, 0.0)
    }

    /// Clamps `value` into the range and snaps it to the step grid.
    pub fn constrain(&self, value: f64) -> f64 {
        let (lo, hi) = if self.min <= self.max {
            (self.min, self.max)
        } else {
            (self.max, self.min)
        };

        if value.is_nan() {
            return self.default.clamp(lo, hi);
        }

        let mut v = value.clamp(lo, hi);
        if self.step > 0.0 {
            v = lo + ((v - lo) / self.step).round() * self.step;
            v = v.clamp(lo, hi);
        }
        v
    }
}

impl Default for ParameterRange {
    fn default() -> Self {
        Self::new(0.0, 1.0, 0.0, 0.0)
    }
}

/// Index of a zone inside the [`ZoneTable`] of the module that declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneId(pub usize);

/// A live parameter value cell.
#[derive(Debug)]
pub struct Zone(AtomicCell<f32>);

impl Zone {
    pub fn new(value: f32) -> Self {
        Self(AtomicCell::new(value))
    }

    pub fn get(&self) -> f32 {
        self.0.load()
    }

    pub fn set(&self, value: f32) {
        self.0.store(value);
    }
}

/// The modulation output of a module: the latest value and whether it is new.
#[derive(Debug)]
pub struct ModulationState {
    value: AtomicCell<f64>,
    dirty: AtomicBool,
}

impl ModulationState {
    pub fn new() -> Self {
        Self {
            value: AtomicCell::new(0.0),
            dirty: AtomicBool::new(false),
        }
    }

    /// Called by the module whenever it decides it has new modulation output.
    pub fn publish(&self, value: f64) {
        self.value.store(value);
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns the value if it was published since the last call, clearing the flag.
    pub fn take(&self) -> Option<f64> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.value.load())
        } else {
            None
        }
    }

    pub fn peek(&self) -> f64 {
        self.value.load()
    }
}

impl Default for ModulationState {
    fn default() -> Self {
        Self::new()
    }
}

/// Every zone owned by one compiled module, plus its optional modulation output.
#[derive(Debug)]
pub struct ZoneTable {
    zones: Box<[Zone]>,
    modulation: Option<ModulationState>,
}

impl ZoneTable {
    pub fn new(initial: &[f32], with_modulation: bool) -> Self {
        Self {
            zones: initial.iter().map(|&v| Zone::new(v)).collect(),
            modulation: with_modulation.then(ModulationState::new),
        }
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(id.0)
    }

    /// Reads a zone, `0.0` for an unknown id.
    pub fn value(&self, id: ZoneId) -> f32 {
        self.zone(id).map_or(0.0, Zone::get)
    }

    pub fn modulation(&self) -> Option<&ModulationState> {
        self.modulation.as_ref()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledParameter {
    pub label: String,
    pub range: ParameterRange,
    pub zone: ZoneId,
}

/// The stateful processing half of a compiled module. Lives on the audio thread.
pub trait DspProcessor: Send + 'static {
    fn prepare(&mut self, spec: ProcessSpec);

    fn reset(&mut self);

    // Process a buffer of samples in place
    fn process_block(&mut self, buffer: &mut [f32]);

    fn handle_event(&mut self, _event: &Event) {}

    fn handles_events(&self) -> bool {
        false
    }
}

/// Output of a successful compile.
pub struct CompiledModule {
    parameters: Vec<CompiledParameter>,
    zones: Arc<ZoneTable>,
    processor: Box<dyn DspProcessor>,
}

impl CompiledModule {
    pub fn new(
        parameters: Vec<CompiledParameter>,
        zones: Arc<ZoneTable>,
        processor: Box<dyn DspProcessor>,
    ) -> Self {
        Self {
            parameters,
            zones,
            processor,
        }
    }

    pub fn list_parameters(&self) -> &[CompiledParameter] {
        &self.parameters
    }

    pub fn modulation_zone(&self) -> Option<&ModulationState> {
        self.zones.modulation()
    }

    pub fn zones(&self) -> &Arc<ZoneTable> {
        &self.zones
    }

    pub fn into_parts(
        self,
    ) -> (
        Vec<CompiledParameter>,
        Arc<ZoneTable>,
        Box<dyn DspProcessor>,
    ) {
        (self.parameters, self.zones, self.processor)
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("parameters", &self.parameters)
            .field("zones", &self.zones.len())
            .field("modulation", &self.zones.modulation().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_constrain_clamps_and_snaps() {
        let range = ParameterRange::new(0.0, 1.0, 0.25, 0.5);
        assert_eq!(range.constrain(0.3), 0.25);
        assert_eq!(range.constrain(0.4), 0.5);
        assert_eq!(range.constrain(-3.0), 0.0);
        assert_eq!(range.constrain(7.0), 1.0);
        assert_eq!(range.constrain(f64::NAN), 0.5);
    }

    #[test]
    fn test_range_without_step_is_continuous() {
        let range = ParameterRange::new(-1.0, 1.0, 0.0, 0.0);
        assert_eq!(range.constrain(0.123), 0.123);
    }

    #[test]
    fn test_modulation_take_clears_flag() {
        let state = ModulationState::new();
        assert_eq!(state.take(), None);

        state.publish(0.7);
        assert_eq!(state.take(), Some(0.7));
        assert_eq!(state.take(), None);
        assert_eq!(state.peek(), 0.7);
    }

    #[test]
    fn test_zone_table_lookup() {
        let table = ZoneTable::new(&[0.5, 1.0], false);
        assert_eq!(table.len(), 2);
        assert_eq!(table.value(ZoneId(1)), 1.0);
        assert!(table.zone(ZoneId(2)).is_none());
        assert!(table.modulation().is_none());
    }
}
