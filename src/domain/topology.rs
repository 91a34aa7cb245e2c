//! Topology Cache
//!
//! Services and characteristics discovered on the current connection. The
//! whole cache is replaced on each successful discovery and cleared on
//! disconnect; it is never patched piecemeal.

use crate::domain::models::{Characteristic, CharacteristicKey, Service};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct TopologyCache {
    services: Vec<Service>,
    // key -> (service index, characteristic index)
    index: HashMap<CharacteristicKey, (usize, usize)>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a freshly discovered service set.
    pub fn replace(&mut self, services: Vec<Service>) {
        let mut index = HashMap::new();
        for (si, service) in services.iter().enumerate() {
            for (ci, characteristic) in service.characteristics.iter().enumerate() {
                // Keys are always built from the owning service uuid
                let key = CharacteristicKey::new(service.uuid, characteristic.uuid);
                index.entry(key).or_insert((si, ci));
            }
        }
        self.services = services;
        self.index = index;
    }

    pub fn clear(&mut self) {
        self.services.clear();
        self.index.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn characteristic(&self, key: &CharacteristicKey) -> Option<&Characteristic> {
        let (si, ci) = *self.index.get(key)?;
        self.services.get(si)?.characteristics.get(ci)
    }

    pub fn characteristic_count(&self) -> usize {
        self.index.len()
    }

    /// Remember the latest value seen for a characteristic.
    pub fn record_value(&mut self, key: &CharacteristicKey, value: &[u8]) {
        if let Some(&(si, ci)) = self.index.get(key) {
            if let Some(c) = self
                .services
                .get_mut(si)
                .and_then(|s| s.characteristics.get_mut(ci))
            {
                c.value = Some(value.to_vec());
            }
        }
    }
}
