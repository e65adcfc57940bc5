//! Device Registry
//!
//! Owns every known [`Device`], keyed by its canonical address. Removal is the
//! only way an entry goes away; cancelling sessions that belong to a removed
//! device is orchestrated by [`crate::adapter::HostController::remove_device`].

use crate::device::{AddressType, Device};
use crate::eir::Advertisement;
use crate::engine::KnownDevice;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Map of devices keyed by canonical address
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    /// Addresses whose object has been made visible to clients
    exported: HashSet<String>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &str) -> Option<&Device> {
        self.devices.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Device> {
        self.devices.get_mut(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.devices.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Addresses of every registered device
    pub fn addresses(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    /// Return the device for `key_address`, creating it on first sight. The
    /// advertised address and address type are refreshed either way.
    pub fn upsert_discovered(
        &mut self,
        key_address: &str,
        advertised_address: &str,
        address_type: AddressType,
    ) -> &mut Device {
        let device = self.devices.entry(key_address.to_string()).or_insert_with(|| {
            debug!("New device {}", key_address);
            Device::new(key_address)
        });

        device.is_random_address = address_type == AddressType::Random;
        device.advertised_address = advertised_address.to_string();
        device
    }

    /// Create the record of a device the Link Engine already knows about.
    /// Returns `None` when the device is already registered.
    pub fn insert_known(&mut self, known: &KnownDevice) -> Option<&mut Device> {
        if self.devices.contains_key(&known.address) {
            return None;
        }

        let mut device = Device::new(&known.address);
        device.is_random_address = known.address_type == AddressType::Random;
        device.paired.set(known.is_paired);
        device.name.set(known.name.clone());
        if let Some(identity) = &known.identity_address {
            device.identity_address.set(identity.clone());
        }
        device.update_alias();

        Some(self.devices.entry(known.address.clone()).or_insert(device))
    }

    /// Drop a device; `None` if it was not registered
    pub fn remove(&mut self, address: &str) -> Option<Device> {
        self.exported.remove(address);
        self.devices.remove(address)
    }

    pub fn is_exported(&self, address: &str) -> bool {
        self.exported.contains(address)
    }

    pub fn mark_exported(&mut self, address: &str) {
        self.exported.insert(address.to_string());
    }
}

/// Fold one advertisement into a device. Only fields present in the payload
/// are touched; the alias is always recomputed.
pub fn merge_advertisement(device: &mut Device, adv: &Advertisement, rssi: i16) {
    device.rssi.set(rssi);

    if let Some(flags) = &adv.flags {
        device.advertising_flags.set(flags.clone());
    }
    if let Some(name) = &adv.name {
        device.name.set(name.clone());
    }
    if let Some(tx_power) = adv.tx_power {
        device.tx_power.set(tx_power);
    }
    if let Some(class) = adv.class {
        device.class.set(class);
    }
    if let Some(appearance) = adv.appearance {
        device.set_appearance(appearance);
    }
    if !adv.service_uuids.is_empty() {
        device.service_uuids.set(adv.service_uuids.clone());
    }
    if !adv.service_data.is_empty() {
        device.service_data.set(adv.service_data.clone());
    }
    if let Some((id, data)) = &adv.manufacturer_data {
        let mut manufacturer = std::collections::BTreeMap::new();
        manufacturer.insert(*id, data.clone());
        device.manufacturer_data.set(manufacturer);
    }

    device.update_alias();
}
