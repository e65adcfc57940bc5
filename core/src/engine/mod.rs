//! Link Engine seam
//!
//! The Link Engine performs the radio work. Commands go out through the
//! [`LinkEngine`] trait and return immediately; results come back later as
//! [`EngineEvent`]s, delivered in order on the same logical thread as client
//! requests.

pub mod sim;

use crate::config::ScanParameters;
use crate::device::AddressType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Failures reported synchronously by Link Engine commands
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(u32),
}

// ============================================================================
// IDENTIFIERS & SMALL TYPES
// ============================================================================

/// Connection identifier allocated by the Link Engine for a GATT link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u32);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a HID attachment made on top of a GATT link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HidId(pub u32);

/// Security requested when pairing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRequirements {
    pub bond: bool,
    pub mitm: bool,
}

/// Pairing progress reported by the Link Engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairState {
    NotPaired,
    Started,
    Paired,
    Canceled,
    Failed,
}

impl std::fmt::Display for PairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotPaired => write!(f, "NotPaired"),
            Self::Started => write!(f, "Started"),
            Self::Paired => write!(f, "Paired"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Security manager error codes that accompany a `Failed` pairing state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairError {
    #[default]
    None,
    AlreadyPaired,
    InProgress,
    InvalidPairReq,
    L2cConn,
    NoSuchDevice,
    PasskeyFailed,
    OobNotAvailable,
    AuthReqInfeasible,
    ConfValueMismatched,
    PairingNotSupported,
    EncrKeySize,
    RepeatedAttempt,
    InvalidParam,
    UnexpectedSmCmd,
    SendSmCmd,
    EncrConn,
    UnexpectedL2cEvt,
    Stalled,
    Memory,
    Unknown,
}

/// GATT link state reported by the Link Engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectState {
    Connected,
    Disconnected,
    DisconnectedByUs,
    Error,
}

impl ConnectState {
    /// Every state other than `Connected` ends the link or the attempt
    pub fn is_disconnect(&self) -> bool {
        !matches!(self, Self::Connected)
    }
}

/// Device record held in the Link Engine's persistent store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub address: String,
    pub address_type: AddressType,
    #[serde(default)]
    pub name: String,
    pub is_paired: bool,
    #[serde(default)]
    pub identity_address: Option<String>,
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Imperative commands understood by the Link Engine. Every call returns
/// without waiting for the radio; completion is signalled by an event.
#[cfg_attr(test, mockall::automock)]
pub trait LinkEngine: Send {
    fn start_discovery(&mut self, params: &ScanParameters) -> Result<(), EngineError>;

    fn stop_discovery(&mut self) -> Result<(), EngineError>;

    fn pair(
        &mut self,
        address: &str,
        is_random: bool,
        security: SecurityRequirements,
    ) -> Result<(), EngineError>;

    fn cancel_pair(&mut self, address: &str, is_random: bool) -> Result<(), EngineError>;

    /// Start a GATT connection; the returned id tags later state callbacks
    fn gatt_connect(&mut self, address: &str, is_random: bool) -> Result<ConnectionId, EngineError>;

    fn gatt_disconnect(&mut self, conn_id: ConnectionId) -> Result<(), EngineError>;

    fn start_encryption(&mut self, conn_id: ConnectionId) -> Result<(), EngineError>;

    fn hid_attach(&mut self, conn_id: ConnectionId, name: &str) -> Option<HidId>;

    fn hid_detach(&mut self, hid_id: HidId);

    /// Devices stored by the Link Engine across restarts
    fn known_devices(&mut self) -> Vec<KnownDevice>;
}

// ============================================================================
// CALLBACKS
// ============================================================================

/// Payload of a device-discovered callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    /// Canonical key address (identity address when the stack resolved one)
    pub address: String,
    /// Address carried by this advertisement
    pub advertised_address: String,
    pub address_type: AddressType,
    pub rssi: i16,
    /// Raw advertisement payload, hex encoded in serialized form
    #[serde(with = "hex_bytes", default)]
    pub eir: Vec<u8>,
}

/// One callback delivered by the Link Engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    DeviceDiscovered(DiscoveryReport),
    PairStateChanged {
        address: String,
        state: PairState,
        #[serde(default)]
        error: PairError,
        #[serde(default)]
        identity_address: Option<String>,
    },
    GattConnectionStateChanged {
        conn_id: ConnectionId,
        state: ConnectState,
    },
}

/// Receiver of Link Engine callbacks
pub trait LinkCallbacks {
    fn on_device_discovered(&mut self, report: DiscoveryReport);

    fn on_pair_state_changed(
        &mut self,
        address: &str,
        state: PairState,
        error: PairError,
        identity_address: Option<String>,
    );

    fn on_gatt_connection_state_changed(&mut self, conn_id: ConnectionId, state: ConnectState);

    /// Route one event to the matching callback
    fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::DeviceDiscovered(report) => self.on_device_discovered(report),
            EngineEvent::PairStateChanged {
                address,
                state,
                error,
                identity_address,
            } => self.on_pair_state_changed(&address, state, error, identity_address),
            EngineEvent::GattConnectionStateChanged { conn_id, state } => {
                self.on_gatt_connection_state_changed(conn_id, state)
            }
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text.trim()).map_err(serde::de::Error::custom)
    }
}
