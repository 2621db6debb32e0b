use arc_swap::{ArcSwap, Guard};
use crossbeam::atomic::AtomicCell;
use log::debug;
use std::sync::{Arc, Mutex, PoisonError};

use crate::dsp::{ParameterRange, ZoneId, ZoneTable};

/// Invoked after a value reached a zone, with the holder position and the
/// constrained value.
pub type ChangeCallback = Arc<dyn Fn(usize, f64) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HolderError {
    IndexOutOfRange { index: usize, len: usize },
}

impl std::fmt::Display for HolderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HolderError::IndexOutOfRange { index, len } => {
                write!(f, "holder index {index} out of range (registry has {len})")
            }
        }
    }
}

impl std::error::Error for HolderError {}

/// The module currently receiving holder writes, tagged with its activation
/// generation.
#[derive(Debug, Clone)]
pub struct ActiveModule {
    pub generation: u64,
    pub zones: Arc<ZoneTable>,
}

/// Where a holder forwards to. Only honoured while `generation` matches the
/// active module's.
#[derive(Clone)]
pub struct Binding {
    pub generation: u64,
    pub zone: ZoneId,
    pub range: ParameterRange,
    pub on_change: Option<ChangeCallback>,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("generation", &self.generation)
            .field("zone", &self.zone)
            .field("range", &self.range)
            .field("on_change", &self.on_change.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Slot {
    binding: Option<Binding>,
    // NaN until something is forwarded. Shared across table versions.
    last_value: Arc<AtomicCell<f64>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            binding: None,
            last_value: Arc::new(AtomicCell::new(f64::NAN)),
        }
    }
}

/// One immutable version of every holder binding plus the module they target.
#[derive(Debug, Clone, Default)]
pub struct HolderTable {
    active: Option<ActiveModule>,
    slots: Vec<Slot>,
}

impl HolderTable {
    pub fn active(&self) -> Option<&ActiveModule> {
        self.active.as_ref()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn binding(&self, index: usize) -> Option<&Binding> {
        self.slots.get(index)?.binding.as_ref()
    }

    fn check(&self, index: usize) -> Result<(), HolderError> {
        if index < self.slots.len() {
            Ok(())
        } else {
            Err(HolderError::IndexOutOfRange {
                index,
                len: self.slots.len(),
            })
        }
    }

    // Seeds the bound zone with the holder's last value, or the range default.
    fn seed(&self, index: usize) {
        let (Some(slot), Some(active)) = (self.slots.get(index), &self.active) else {
            return;
        };
        let Some(binding) = slot.binding.as_ref() else {
            return;
        };
        if binding.generation != active.generation {
            return;
        }

        let last = slot.last_value.load();
        let value = if last.is_nan() {
            binding.range.default
        } else {
            last
        };

        if let Some(zone) = active.zones.zone(binding.zone) {
            zone.set(binding.range.constrain(value) as f32);
        }
    }
}

/// Append-only sequence of parameter holders.
///
/// Writers (the compile side) publish a new [`HolderTable`] for every change;
/// readers (`forward`, modulation polling, the audio node) load the current
/// table lock-free, so each call observes either the whole old or the whole
/// new binding state.
pub struct HolderRegistry {
    table: ArcSwap<HolderTable>,
    // Serializes writers and keeps superseded tables alive while a reader may
    // still hold them, so they are freed here rather than on the audio thread.
    retired: Mutex<Vec<Arc<HolderTable>>>,
}

impl HolderRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(HolderTable::default()),
            retired: Mutex::new(Vec::new()),
        }
    }

    pub fn load(&self) -> Guard<Arc<HolderTable>> {
        self.table.load()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ensure_capacity(&self, n: usize) {
        if self.len() >= n {
            return;
        }

        self.update(|table| {
            while table.slots.len() < n {
                table.slots.push(Slot::new());
            }
            Ok(())
        })
        .ok();
        debug!("Holder registry grown to {n} slots");
    }

    pub fn bind(
        &self,
        index: usize,
        zone: ZoneId,
        range: ParameterRange,
        on_change: Option<ChangeCallback>,
    ) -> Result<(), HolderError> {
        self.update(|table| {
            table.check(index)?;
            let generation = table.active.as_ref().map_or(0, |a| a.generation);
            table.slots[index].binding = Some(Binding {
                generation,
                zone,
                range,
                on_change,
            });
            table.seed(index);
            Ok(())
        })
    }

    pub fn unbind(&self, index: usize) -> Result<(), HolderError> {
        {
            let table = self.table.load();
            table.check(index)?;
            if table.binding(index).is_none() {
                return Ok(());
            }
        }

        self.update(|table| {
            table.check(index)?;
            table.slots[index].binding = None;
            Ok(())
        })
    }

    /// Clears every binding and detaches the active module, keeping the size.
    pub fn unbind_all(&self) {
        self.update(|table| {
            table.active = None;
            for slot in &mut table.slots {
                slot.binding = None;
            }
            Ok(())
        })
        .ok();
    }

    /// Publishes `module` as the active module together with `bindings`, in a
    /// single swap. Every holder not named in `bindings` ends up unbound.
    pub fn activate<I>(&self, module: ActiveModule, bindings: I) -> Result<(), HolderError>
    where
        I: IntoIterator<Item = (usize, Binding)>,
    {
        self.update(|table| {
            for slot in &mut table.slots {
                slot.binding = None;
            }
            table.active = Some(module);

            for (index, binding) in bindings {
                table.check(index)?;
                table.slots[index].binding = Some(binding);
                table.seed(index);
            }
            Ok(())
        })
    }

    /// Sends `value` through the holder at `index`. Returns whether it reached a zone.
    pub fn forward(&self, index: usize, value: f64) -> bool {
        let table = self.table.load();
        let Some(slot) = table.slots.get(index) else {
            return false;
        };
        slot.last_value.store(value);

        let (Some(binding), Some(active)) = (&slot.binding, &table.active) else {
            return false;
        };
        if binding.generation != active.generation {
            return false;
        }
        let Some(zone) = active.zones.zone(binding.zone) else {
            return false;
        };

        let value = binding.range.constrain(value);
        zone.set(value as f32);
        if let Some(callback) = &binding.on_change {
            callback(index, value);
        }
        true
    }

    pub fn is_bound(&self, index: usize) -> bool {
        self.table.load().binding(index).is_some()
    }

    pub fn bound_zone(&self, index: usize) -> Option<ZoneId> {
        self.table.load().binding(index).map(|b| b.zone)
    }

    /// The last value forwarded into the holder, bound or not.
    pub fn last_value(&self, index: usize) -> Option<f64> {
        let table = self.table.load();
        let value = table.slots.get(index)?.last_value.load();
        (!value.is_nan()).then_some(value)
    }

    pub fn active_generation(&self) -> Option<u64> {
        self.table.load().active.as_ref().map(|a| a.generation)
    }

    pub fn handle(self: &Arc<Self>, index: usize) -> ParameterHandle {
        ParameterHandle {
            index,
            registry: Arc::clone(self),
        }
    }

    fn update<F>(&self, f: F) -> Result<(), HolderError>
    where
        F: FnOnce(&mut HolderTable) -> Result<(), HolderError>,
    {
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = HolderTable::clone(&self.table.load());
        f(&mut next)?;

        let previous = self.table.swap(Arc::new(next));
        retired.push(previous);
        retired.retain(|t| Arc::strong_count(t) > 1);
        Ok(())
    }
}

impl Default for HolderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A host-facing reference to one holder position. Stays valid across any
/// number of recompiles.
#[derive(Clone)]
pub struct ParameterHandle {
    index: usize,
    registry: Arc<HolderRegistry>,
}

impl ParameterHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set(&self, value: f64) -> bool {
        self.registry.forward(self.index, value)
    }

    pub fn is_bound(&self) -> bool {
        self.registry.is_bound(self.index)
    }

    pub fn last_value(&self) -> Option<f64> {
        self.registry.last_value(self.index)
    }
}

impl std::fmt::Debug for ParameterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterHandle")
            .field("index", &self.index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn module(generation: u64, values: &[f32]) -> ActiveModule {
        ActiveModule {
            generation,
            zones: Arc::new(ZoneTable::new(values, false)),
        }
    }

    fn binding(generation: u64, zone: usize) -> Binding {
        Binding {
            generation,
            zone: ZoneId(zone),
            range: ParameterRange::new(0.0, 1.0, 0.0, 0.5),
            on_change: None,
        }
    }

    #[test]
    fn test_ensure_capacity_only_grows() {
        let registry = HolderRegistry::new();
        registry.ensure_capacity(3);
        assert_eq!(registry.len(), 3);

        registry.ensure_capacity(1);
        assert_eq!(registry.len(), 3);
        assert!(!registry.is_bound(0));
    }

    #[test]
    fn test_ensure_capacity_publishes_once_per_growth() {
        let registry = HolderRegistry::new();
        registry.ensure_capacity(4);
        let grown = registry.table.load_full();

        registry.ensure_capacity(4);
        registry.ensure_capacity(2);
        assert!(Arc::ptr_eq(&grown, &registry.table.load_full()));

        registry.ensure_capacity(6);
        let regrown = registry.table.load_full();
        assert!(!Arc::ptr_eq(&grown, &regrown));
        assert_eq!(regrown.len(), 6);
        assert_eq!(grown.len(), 4, "published tables are never mutated");
    }

    #[test]
    fn test_bind_out_of_range_fails() {
        let registry = HolderRegistry::new();
        registry.ensure_capacity(1);

        let err = registry
            .bind(1, ZoneId(0), ParameterRange::default(), None)
            .unwrap_err();
        assert_eq!(err, HolderError::IndexOutOfRange { index: 1, len: 1 });
    }

    #[test]
    fn test_forward_writes_zone_and_calls_back() {
        let registry = HolderRegistry::new();
        registry.ensure_capacity(2);
        let active = module(1, &[0.0, 0.0]);
        let zones = Arc::clone(&active.zones);
        registry.activate(active, [(1, binding(1, 0))]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: ChangeCallback = Arc::new(move |index, _| {
            assert_eq!(index, 1);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry
            .bind(1, ZoneId(0), ParameterRange::new(0.0, 1.0, 0.0, 0.5), Some(callback))
            .unwrap();

        assert!(registry.forward(1, 0.25));
        assert_eq!(zones.value(ZoneId(0)), 0.25);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // out of range values are clamped
        assert!(registry.forward(1, 4.0));
        assert_eq!(zones.value(ZoneId(0)), 1.0);

        assert!(!registry.forward(0, 0.75), "holder 0 is unbound");
        assert!(!registry.forward(9, 0.75), "no holder at 9");
    }

    #[test]
    fn test_unbind_all_keeps_size_and_detaches() {
        let registry = HolderRegistry::new();
        registry.ensure_capacity(2);
        let active = module(1, &[0.0]);
        let zones = Arc::clone(&active.zones);
        registry.activate(active, [(0, binding(1, 0))]).unwrap();

        registry.unbind_all();
        assert_eq!(registry.len(), 2);
        assert!(!registry.is_bound(0));
        assert_eq!(registry.active_generation(), None);

        zones.zone(ZoneId(0)).unwrap().set(-99.0);
        assert!(!registry.forward(0, 0.1));
        assert_eq!(zones.value(ZoneId(0)), -99.0);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let registry = HolderRegistry::new();
        registry.ensure_capacity(1);
        let active = module(2, &[0.0]);
        let zones = Arc::clone(&active.zones);
        registry.activate(active, [(0, binding(1, 0))]).unwrap();

        assert!(!registry.forward(0, 0.3));
        assert_eq!(zones.value(ZoneId(0)), 0.0);
    }

    #[test]
    fn test_rebinding_seeds_last_value() {
        let registry = HolderRegistry::new();
        registry.ensure_capacity(1);
        registry.forward(0, 0.8);
        assert_eq!(registry.last_value(0), Some(0.8));

        let active = module(1, &[0.0]);
        let zones = Arc::clone(&active.zones);
        registry.activate(active, [(0, binding(1, 0))]).unwrap();

        assert_eq!(zones.value(ZoneId(0)), 0.8);
    }

    #[test]
    fn test_fresh_binding_seeds_default() {
        let registry = Arc::new(HolderRegistry::new());
        registry.ensure_capacity(1);

        let active = module(1, &[0.0]);
        let zones = Arc::clone(&active.zones);
        registry.activate(active, [(0, binding(1, 0))]).unwrap();
        assert_eq!(zones.value(ZoneId(0)), 0.5);

        let handle = registry.handle(0);
        assert!(handle.is_bound());
        assert!(handle.set(0.1));
        assert_eq!(zones.value(ZoneId(0)), 0.1);
        assert_eq!(handle.last_value(), Some(0.1));
    }
}
