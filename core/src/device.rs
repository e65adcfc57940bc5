//! Per-device data model
//!
//! A [`Device`] mirrors what is published for one peer. Every mutable field is
//! a [`Property`], which remembers whether it changed since it was last
//! published so that only real changes produce notifications.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// ============================================================================
// SENTINEL DEFAULTS
// ============================================================================

// Values from the Bluetooth SIG assigned numbers used before a field has ever
// been received in an advertisement.
pub const DEFAULT_RSSI: i16 = -128;
pub const DEFAULT_TX_POWER: i16 = -128;
pub const DEFAULT_CLASS: u32 = 0x1F00;
pub const DEFAULT_APPEARANCE: u16 = 0;
pub const DEFAULT_MANUFACTURER_ID: u16 = 0xFFFF;

/// Device type published for every device handled here
pub const DEVICE_TYPE_LE: &str = "LE";

const APPEARANCE_CATEGORY_MASK: u16 = 0xffc0;
const APPEARANCE_CATEGORY_HID: u16 = 0x0f;

// ============================================================================
// CHANGE-TRACKED PROPERTY
// ============================================================================

/// A value plus a "changed since last published" flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property<T> {
    value: T,
    updated: bool,
}

impl<T: PartialEq> Property<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            updated: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Store a value; the flag is raised only if the value differs
    pub fn set(&mut self, value: T) {
        if self.value != value {
            self.value = value;
            self.updated = true;
        }
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn clear_updated(&mut self) {
        self.updated = false;
    }
}

impl<T: PartialEq + Default> Default for Property<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ============================================================================
// DEVICE
// ============================================================================

/// Address type reported by the Link Engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    Random,
}

/// One discovered or paired peer
#[derive(Debug, Clone)]
pub struct Device {
    /// Canonical key address (immutable)
    pub address: String,
    pub is_random_address: bool,
    /// Address the peer is currently advertising with
    pub advertised_address: String,

    pub paired: Property<bool>,
    pub connected: Property<bool>,
    pub trusted: Property<bool>,
    pub blocked: Property<bool>,
    pub services_resolved: Property<bool>,

    /// Alias explicitly set by a client; empty when unset
    pub user_alias: String,
    pub alias: Property<String>,
    pub name: Property<String>,
    pub tx_power: Property<i16>,
    pub rssi: Property<i16>,
    pub class: Property<u32>,
    pub appearance: Property<u16>,
    pub icon: Property<String>,
    pub advertising_flags: Property<Vec<u8>>,
    pub service_uuids: Property<BTreeSet<Uuid>>,
    pub service_data: Property<BTreeMap<Uuid, Vec<u8>>>,
    pub manufacturer_data: Property<BTreeMap<u16, Vec<u8>>>,
    /// Resolved identity address; empty until known
    pub identity_address: Property<String>,
}

impl Device {
    /// Create a device with sentinel defaults
    pub fn new(address: &str) -> Self {
        let mut manufacturer = BTreeMap::new();
        manufacturer.insert(DEFAULT_MANUFACTURER_ID, Vec::new());

        let mut device = Self {
            address: address.to_string(),
            is_random_address: false,
            advertised_address: address.to_string(),
            paired: Property::new(false),
            connected: Property::new(false),
            trusted: Property::new(false),
            blocked: Property::new(false),
            services_resolved: Property::new(false),
            user_alias: String::new(),
            alias: Property::new(String::new()),
            name: Property::new(String::new()),
            tx_power: Property::new(DEFAULT_TX_POWER),
            rssi: Property::new(DEFAULT_RSSI),
            class: Property::new(DEFAULT_CLASS),
            appearance: Property::new(DEFAULT_APPEARANCE),
            icon: Property::new(appearance_to_icon(DEFAULT_APPEARANCE).to_string()),
            advertising_flags: Property::new(vec![0]),
            service_uuids: Property::default(),
            service_data: Property::default(),
            manufacturer_data: Property::new(manufacturer),
            identity_address: Property::new(String::new()),
        };
        device.update_alias();
        device
    }

    /// Recompute the alias: user alias, else name, else the address with
    /// `:` replaced by `-`.
    pub fn update_alias(&mut self) {
        let alias = if !self.user_alias.is_empty() {
            self.user_alias.clone()
        } else if !self.name.value().is_empty() {
            self.name.value().clone()
        } else {
            self.address.replace(':', "-")
        };
        self.alias.set(alias);
    }

    /// Set the appearance together with its derived icon
    pub fn set_appearance(&mut self, appearance: u16) {
        self.appearance.set(appearance);
        self.icon.set(appearance_to_icon(appearance).to_string());
    }

    /// Address that should be published: identity address once resolved
    pub fn published_address(&self) -> &str {
        if self.identity_address.value().is_empty() {
            &self.address
        } else {
            self.identity_address.value()
        }
    }

    /// Whether the appearance allows a HID attachment. An appearance never
    /// received is treated as HID-capable.
    pub fn may_be_hid(&self) -> bool {
        let appearance = *self.appearance.value();
        appearance == DEFAULT_APPEARANCE || appearance_category(appearance) == APPEARANCE_CATEGORY_HID
    }

    /// Drop every "changed" flag after publishing
    pub fn clear_updated(&mut self) {
        self.paired.clear_updated();
        self.connected.clear_updated();
        self.trusted.clear_updated();
        self.blocked.clear_updated();
        self.services_resolved.clear_updated();
        self.alias.clear_updated();
        self.name.clear_updated();
        self.tx_power.clear_updated();
        self.rssi.clear_updated();
        self.class.clear_updated();
        self.appearance.clear_updated();
        self.icon.clear_updated();
        self.advertising_flags.clear_updated();
        self.service_uuids.clear_updated();
        self.service_data.clear_updated();
        self.manufacturer_data.clear_updated();
        self.identity_address.clear_updated();
    }
}

// ============================================================================
// APPEARANCE
// ============================================================================

/// Appearance category (upper ten bits)
pub fn appearance_category(appearance: u16) -> u16 {
    (appearance & APPEARANCE_CATEGORY_MASK) >> 6
}

/// Icon name for a GAP appearance value; empty when there is no mapping
pub fn appearance_to_icon(appearance: u16) -> &'static str {
    match appearance_category(appearance) {
        0x00 => "unknown",
        0x01 => "phone",
        0x02 => "computer",
        0x03 => "watch",
        0x04 => "clock",
        0x05 => "video-display",
        0x06 => "remote-control",
        0x07 => "eye-glasses",
        0x08 => "tag",
        0x09 => "key-ring",
        0x0a => "multimedia-player",
        0x0b => "scanner",
        0x0c => "thermometer",
        0x0d => "heart-rate-sensor",
        0x0e => "blood-pressure",
        APPEARANCE_CATEGORY_HID => match appearance & 0x3f {
            0x01 => "input-keyboard",
            0x02 => "input-mouse",
            0x03 | 0x04 => "input-gaming",
            0x05 => "input-tablet",
            0x08 => "scanner",
            _ => "",
        },
        0x10 => "glucose-meter",
        0x11 => "running-walking-sensor",
        0x12 => "cycling",
        0x31 => "pulse-oximeter",
        0x32 => "weight-scale",
        0x33 => "personal-mobility-device",
        0x34 => "continuous-glucose-monitor",
        0x35 => "insulin-pump",
        0x36 => "medication-delivery",
        0x51 => "outdoor-sports-activity",
        _ => "",
    }
}
