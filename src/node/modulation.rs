use crossbeam::atomic::AtomicCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::params::HolderRegistry;

#[derive(Debug)]
struct ModulationSignal {
    value: AtomicCell<f64>,
    updates: AtomicU64,
}

/// Moves the active module's modulation output to the host, once per
/// processing unit.
pub struct ModulationBridge {
    signal: Arc<ModulationSignal>,
}

/// Host-side reader of the forwarded modulation signal.
#[derive(Clone)]
pub struct ModulationHandle {
    signal: Arc<ModulationSignal>,
}

impl ModulationBridge {
    pub fn new() -> (Self, ModulationHandle) {
        let signal = Arc::new(ModulationSignal {
            value: AtomicCell::new(0.0),
            updates: AtomicU64::new(0),
        });

        (
            Self {
                signal: Arc::clone(&signal),
            },
            ModulationHandle { signal },
        )
    }

    /// Takes the active module's new modulation value, if any, and forwards
    /// it. Without an active module there is never a value.
    pub fn poll(&self, registry: &HolderRegistry) -> Option<f64> {
        let table = registry.load();
        let value = table.active()?.zones.modulation()?.take()?;

        self.signal.value.store(value);
        self.signal.updates.fetch_add(1, Ordering::Release);
        Some(value)
    }
}

impl ModulationHandle {
    /// Latest forwarded value, `None` before the first one.
    pub fn value(&self) -> Option<f64> {
        if self.signal.updates.load(Ordering::Acquire) == 0 {
            None
        } else {
            Some(self.signal.value.load())
        }
    }

    /// How many values have been forwarded so far.
    pub fn updates(&self) -> u64 {
        self.signal.updates.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::ZoneTable;
    use crate::params::holder::ActiveModule;

    fn activate(registry: &HolderRegistry, generation: u64) -> Arc<ZoneTable> {
        let zones = Arc::new(ZoneTable::new(&[], true));
        registry
            .activate(
                ActiveModule {
                    generation,
                    zones: Arc::clone(&zones),
                },
                std::iter::empty(),
            )
            .unwrap();
        zones
    }

    #[test]
    fn test_forwards_each_value_once() {
        let registry = HolderRegistry::new();
        let (bridge, handle) = ModulationBridge::new();
        let zones = activate(&registry, 1);

        assert_eq!(bridge.poll(&registry), None);
        assert_eq!(handle.value(), None);

        zones.modulation().unwrap().publish(0.4);
        assert_eq!(bridge.poll(&registry), Some(0.4));
        assert_eq!(bridge.poll(&registry), None);
        assert_eq!(handle.value(), Some(0.4));
        assert_eq!(handle.updates(), 1);
    }

    #[test]
    fn test_nothing_without_active_module() {
        let registry = HolderRegistry::new();
        let (bridge, handle) = ModulationBridge::new();
        let zones = activate(&registry, 1);

        zones.modulation().unwrap().publish(0.9);
        registry.unbind_all();

        assert_eq!(bridge.poll(&registry), None);
        assert_eq!(handle.updates(), 0);
    }

    #[test]
    fn test_reads_from_replacement_module() {
        let registry = HolderRegistry::new();
        let (bridge, _) = ModulationBridge::new();
        let old = activate(&registry, 1);
        old.modulation().unwrap().publish(-1.0);

        let new = activate(&registry, 2);
        assert_eq!(bridge.poll(&registry), None);

        new.modulation().unwrap().publish(0.25);
        assert_eq!(bridge.poll(&registry), Some(0.25));
    }
}
