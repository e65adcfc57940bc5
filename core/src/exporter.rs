//! Object Exporter seam
//!
//! The exporter publishes adapter and device state to clients as remote
//! objects with properties. This module defines the trait the host drives,
//! the property payloads, the device object path scheme, and an in-memory
//! [`RecordingExporter`].

use crate::device::{Device, DEVICE_TYPE_LE};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Object path of the single adapter
pub const ADAPTER_OBJECT_PATH: &str = "/org/bluez/hci0";

const DEVICE_PATH_PREFIX: &str = "/org/bluez/hci0/dev_";

// ============================================================================
// PROPERTY PAYLOADS
// ============================================================================

/// Value of one published property
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Str(String),
    I16(i16),
    U16(u16),
    U32(u32),
    Bytes(Vec<u8>),
    StrList(Vec<String>),
    ServiceData(BTreeMap<String, Vec<u8>>),
    ManufacturerData(BTreeMap<u16, Vec<u8>>),
}

/// A named property value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyChange {
    pub name: &'static str,
    pub value: PropertyValue,
}

impl PropertyChange {
    pub fn new(name: &'static str, value: PropertyValue) -> Self {
        Self { name, value }
    }
}

// ============================================================================
// EXPORTER TRAIT
// ============================================================================

/// Sink for object state published to clients
pub trait ObjectExporter: Send {
    /// Make a device object visible with its complete property set
    fn export_device(&mut self, path: &str, properties: Vec<PropertyChange>);

    /// Notify changed properties of an already-exported device
    fn update_device(&mut self, path: &str, changes: Vec<PropertyChange>);

    fn unexport_device(&mut self, path: &str);

    fn update_adapter(&mut self, changes: Vec<PropertyChange>);
}

// ============================================================================
// OBJECT PATHS
// ============================================================================

/// `AA:BB:CC:DD:EE:FF` -> `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`
pub fn device_object_path(address: &str) -> String {
    format!("{}{}", DEVICE_PATH_PREFIX, address.replace(':', "_"))
}

/// Inverse of [`device_object_path`]; `None` for anything that is not a
/// device path of this adapter
pub fn address_from_object_path(path: &str) -> Option<String> {
    let suffix = path.strip_prefix(DEVICE_PATH_PREFIX)?;
    let octets: Vec<&str> = suffix.split('_').collect();
    let well_formed = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !well_formed {
        return None;
    }
    Some(octets.join(":"))
}

// ============================================================================
// DEVICE PROPERTIES
// ============================================================================

fn uuid_list(device: &Device) -> PropertyValue {
    PropertyValue::StrList(
        device
            .service_uuids
            .value()
            .iter()
            .map(|u| u.to_string())
            .collect(),
    )
}

fn service_data(device: &Device) -> PropertyValue {
    PropertyValue::ServiceData(
        device
            .service_data
            .value()
            .iter()
            .map(|(uuid, data)| (uuid.to_string(), data.clone()))
            .collect(),
    )
}

/// Full property set published when a device object first appears
pub fn device_properties(device: &Device) -> Vec<PropertyChange> {
    use PropertyValue::*;

    vec![
        PropertyChange::new("Address", Str(device.published_address().to_string())),
        PropertyChange::new("Type", Str(DEVICE_TYPE_LE.to_string())),
        PropertyChange::new("LegacyPairing", Bool(false)),
        PropertyChange::new("Adapter", Str(ADAPTER_OBJECT_PATH.to_string())),
        PropertyChange::new("Paired", Bool(*device.paired.value())),
        PropertyChange::new("Connected", Bool(*device.connected.value())),
        PropertyChange::new("Trusted", Bool(*device.trusted.value())),
        PropertyChange::new("Blocked", Bool(*device.blocked.value())),
        PropertyChange::new("Alias", Str(device.alias.value().clone())),
        PropertyChange::new("ServicesResolved", Bool(*device.services_resolved.value())),
        PropertyChange::new("AdvertisingFlags", Bytes(device.advertising_flags.value().clone())),
        PropertyChange::new("RSSI", I16(*device.rssi.value())),
        PropertyChange::new("UUIDs", uuid_list(device)),
        PropertyChange::new("ServiceData", service_data(device)),
        PropertyChange::new("Name", Str(device.name.value().clone())),
        PropertyChange::new("TxPower", I16(*device.tx_power.value())),
        PropertyChange::new("Class", U32(*device.class.value())),
        PropertyChange::new("Appearance", U16(*device.appearance.value())),
        PropertyChange::new("Icon", Str(device.icon.value().clone())),
        PropertyChange::new(
            "ManufacturerData",
            ManufacturerData(device.manufacturer_data.value().clone()),
        ),
    ]
}

/// Only the properties whose change flag is raised
pub fn changed_device_properties(device: &Device) -> Vec<PropertyChange> {
    use PropertyValue::*;

    let mut changes = Vec::new();
    let mut push_if = |updated: bool, name: &'static str, value: PropertyValue| {
        if updated {
            changes.push(PropertyChange::new(name, value));
        }
    };

    push_if(
        device.identity_address.is_updated(),
        "Address",
        Str(device.published_address().to_string()),
    );
    push_if(device.paired.is_updated(), "Paired", Bool(*device.paired.value()));
    push_if(device.connected.is_updated(), "Connected", Bool(*device.connected.value()));
    push_if(device.trusted.is_updated(), "Trusted", Bool(*device.trusted.value()));
    push_if(device.blocked.is_updated(), "Blocked", Bool(*device.blocked.value()));
    push_if(device.alias.is_updated(), "Alias", Str(device.alias.value().clone()));
    push_if(
        device.services_resolved.is_updated(),
        "ServicesResolved",
        Bool(*device.services_resolved.value()),
    );
    push_if(
        device.advertising_flags.is_updated(),
        "AdvertisingFlags",
        Bytes(device.advertising_flags.value().clone()),
    );
    push_if(device.rssi.is_updated(), "RSSI", I16(*device.rssi.value()));
    push_if(device.service_uuids.is_updated(), "UUIDs", uuid_list(device));
    push_if(device.service_data.is_updated(), "ServiceData", service_data(device));
    push_if(device.name.is_updated(), "Name", Str(device.name.value().clone()));
    push_if(device.tx_power.is_updated(), "TxPower", I16(*device.tx_power.value()));
    push_if(device.class.is_updated(), "Class", U32(*device.class.value()));
    push_if(device.appearance.is_updated(), "Appearance", U16(*device.appearance.value()));
    push_if(device.icon.is_updated(), "Icon", Str(device.icon.value().clone()));
    push_if(
        device.manufacturer_data.is_updated(),
        "ManufacturerData",
        ManufacturerData(device.manufacturer_data.value().clone()),
    );

    changes
}

// ============================================================================
// RECORDING EXPORTER
// ============================================================================

/// What the exporter was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportEvent {
    DeviceExported { path: String, properties: Vec<PropertyChange> },
    DeviceUpdated { path: String, changes: Vec<PropertyChange> },
    DeviceUnexported { path: String },
    AdapterUpdated { changes: Vec<PropertyChange> },
}

#[derive(Debug, Default)]
struct ExporterLog {
    events: Vec<ExportEvent>,
    objects: BTreeMap<String, BTreeMap<&'static str, PropertyValue>>,
    adapter: BTreeMap<&'static str, PropertyValue>,
}

/// Exporter that keeps the current object tree plus an event log in memory;
/// clones share the same log
#[derive(Debug, Clone, Default)]
pub struct RecordingExporter {
    log: Arc<Mutex<ExporterLog>>,
}

impl RecordingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExportEvent> {
        self.log.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.log.lock().events.clear();
    }

    pub fn is_exported(&self, path: &str) -> bool {
        self.log.lock().objects.contains_key(path)
    }

    /// Exported device paths, sorted
    pub fn device_paths(&self) -> Vec<String> {
        self.log.lock().objects.keys().cloned().collect()
    }

    /// Current value of a device property
    pub fn property(&self, path: &str, name: &str) -> Option<PropertyValue> {
        self.log.lock().objects.get(path)?.get(name).cloned()
    }

    pub fn adapter_property(&self, name: &str) -> Option<PropertyValue> {
        self.log.lock().adapter.get(name).cloned()
    }

    /// Number of change notifications carrying the named device property
    pub fn update_count(&self, path: &str, name: &str) -> usize {
        self.log
            .lock()
            .events
            .iter()
            .filter(|e| match e {
                ExportEvent::DeviceUpdated { path: p, changes } => {
                    p == path && changes.iter().any(|c| c.name == name)
                }
                _ => false,
            })
            .count()
    }
}

impl ObjectExporter for RecordingExporter {
    fn export_device(&mut self, path: &str, properties: Vec<PropertyChange>) {
        let mut log = self.log.lock();
        let object = properties.iter().map(|p| (p.name, p.value.clone())).collect();
        log.objects.insert(path.to_string(), object);
        log.events.push(ExportEvent::DeviceExported {
            path: path.to_string(),
            properties,
        });
    }

    fn update_device(&mut self, path: &str, changes: Vec<PropertyChange>) {
        let mut log = self.log.lock();
        if let Some(object) = log.objects.get_mut(path) {
            for change in &changes {
                object.insert(change.name, change.value.clone());
            }
        }
        log.events.push(ExportEvent::DeviceUpdated {
            path: path.to_string(),
            changes,
        });
    }

    fn unexport_device(&mut self, path: &str) {
        let mut log = self.log.lock();
        log.objects.remove(path);
        log.events.push(ExportEvent::DeviceUnexported {
            path: path.to_string(),
        });
    }

    fn update_adapter(&mut self, changes: Vec<PropertyChange>) {
        let mut log = self.log.lock();
        for change in &changes {
            log.adapter.insert(change.name, change.value.clone());
        }
        log.events.push(ExportEvent::AdapterUpdated { changes });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_roundtrip() {
        let path = device_object_path("AA:BB:CC:DD:EE:FF");
        assert_eq!(path, "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF");
        assert_eq!(
            address_from_object_path(&path).as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
    }

    #[test]
    fn test_object_path_rejects_foreign_paths() {
        assert_eq!(address_from_object_path("/org/bluez/hci0"), None);
        assert_eq!(address_from_object_path("/org/bluez/hci1/dev_AA_BB_CC_DD_EE_FF"), None);
        assert_eq!(address_from_object_path("/org/bluez/hci0/dev_AA_BB"), None);
        assert_eq!(address_from_object_path("/org/bluez/hci0/dev_GG_BB_CC_DD_EE_FF"), None);
    }

    #[test]
    fn test_full_property_set_has_mandatory_fields() {
        let device = Device::new("AA:BB:CC:DD:EE:FF");
        let props = device_properties(&device);
        for name in ["Address", "Type", "LegacyPairing", "Adapter", "Paired", "Alias", "Icon"] {
            assert!(props.iter().any(|p| p.name == name), "missing {}", name);
        }
    }

    #[test]
    fn test_changed_properties_follow_flags() {
        let mut device = Device::new("AA:BB:CC:DD:EE:FF");
        device.clear_updated();
        assert!(changed_device_properties(&device).is_empty());

        device.connected.set(true);
        device.identity_address.set("00:11:22:33:44:55".to_string());
        let changes = changed_device_properties(&device);
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0],
            PropertyChange::new("Address", PropertyValue::Str("00:11:22:33:44:55".to_string()))
        );
        assert_eq!(changes[1].name, "Connected");
    }

    #[test]
    fn test_recording_exporter_tracks_objects() {
        let mut exporter = RecordingExporter::new();
        let path = device_object_path("AA:BB:CC:DD:EE:FF");
        exporter.export_device(&path, device_properties(&Device::new("AA:BB:CC:DD:EE:FF")));
        exporter.update_device(
            &path,
            vec![PropertyChange::new("Paired", PropertyValue::Bool(true))],
        );

        assert_eq!(exporter.property(&path, "Paired"), Some(PropertyValue::Bool(true)));
        assert_eq!(exporter.update_count(&path, "Paired"), 1);

        exporter.unexport_device(&path);
        assert!(!exporter.is_exported(&path));
    }
}
