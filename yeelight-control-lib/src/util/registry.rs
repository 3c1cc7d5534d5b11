use indexmap::IndexMap;

use crate::util::device::{Device, DeviceKey};

/// Whether an upsert added a new device or refreshed a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
}

/// Devices seen during one discovery session, in the order first seen.
///
/// A second sighting of the same device replaces its record in place.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: IndexMap<DeviceKey, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, device: Device) -> Upsert {
        match self.devices.insert(device.key(), device) {
            Some(_) => Upsert::Replaced,
            None => Upsert::Inserted,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn into_devices(self) -> Vec<Device> {
        self.devices.into_values().collect()
    }
}
