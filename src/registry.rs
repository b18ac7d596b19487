//! Deduplicated, ordered set of peripherals discovered in a scan session.

use std::cmp::Ordering;

use log::debug;

use crate::device::{DeviceId, PeripheralDevice};

/// Holds the devices seen since the last `reset`, unique by identity.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<PeripheralDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates a device by identity.
    ///
    /// Returns whether the visible list changed: a new device was added, or
    /// an existing record's name, rssi or advertisement differs from what was
    /// stored. `last_seen` alone never counts as a change. With `sort` set,
    /// the list is reordered by signal strength (stronger first) then name.
    pub fn upsert(&mut self, device: PeripheralDevice, sort: bool) -> bool {
        let changed = match self.devices.iter_mut().find(|d| d.id() == device.id()) {
            Some(existing) => {
                let material = (device.name.is_some() && device.name != existing.name)
                    || (device.rssi.is_some() && device.rssi != existing.rssi)
                    || device.advertisement != existing.advertisement;
                if device.name.is_some() {
                    existing.name = device.name;
                }
                if device.rssi.is_some() {
                    existing.rssi = device.rssi;
                }
                existing.advertisement = device.advertisement;
                existing.last_seen = device.last_seen;
                existing.driver_backed |= device.driver_backed;
                material
            }
            None => {
                debug!("registry: new device {}", device.id());
                self.devices.push(device);
                true
            }
        };
        if sort {
            self.devices.sort_by(compare);
        }
        changed
    }

    /// Clears the registry for a new scan session.
    pub fn reset(&mut self) {
        self.devices.clear();
    }

    pub fn get(&self, id: &DeviceId) -> Option<&PeripheralDevice> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// The full current device list, in registry order.
    pub fn snapshot(&self) -> Vec<PeripheralDevice> {
        self.devices.clone()
    }
}

/// Signal strength descending (unknown weakest), then name ascending (unnamed
/// last), then id, so equal-strength devices come out in a deterministic
/// total order.
fn compare(a: &PeripheralDevice, b: &PeripheralDevice) -> Ordering {
    let rssi_a = a.rssi.unwrap_or(i16::MIN);
    let rssi_b = b.rssi.unwrap_or(i16::MIN);
    rssi_b
        .cmp(&rssi_a)
        .then_with(|| match (a.name.as_deref(), b.name.as_deref()) {
            (Some(na), Some(nb)) => na.cmp(nb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id().cmp(b.id()))
}
