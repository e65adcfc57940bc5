// lehost core: session and state management for a BLE host
#![allow(clippy::empty_line_after_doc_comments)]
//
// Client requests and Link Engine callbacks meet here. Everything that can
// be observed from outside (device objects, replies, the scan resource) is
// decided by this crate; radio work and object export live behind traits.

pub mod adapter;
pub mod config;
pub mod connection;
pub mod device;
pub mod eir;
pub mod engine;
pub mod error;
pub mod exporter;
pub mod observer;
pub mod pairing;
pub mod registry;
pub mod reply;
pub mod scan;
pub mod service;
pub mod suspend;

pub use adapter::HostController;
pub use config::{ConfigError, HostConfig, ScanConfig, ScanParameters};
pub use device::{AddressType, Device, Property};
pub use engine::sim::{EngineCommand, SimFaults, SimulatedEngine};
pub use engine::{
    ConnectState, ConnectionId, DiscoveryReport, EngineError, EngineEvent, KnownDevice,
    LinkCallbacks, LinkEngine, PairError, PairState,
};
pub use error::{BluetoothError, HostResult};
pub use exporter::{ObjectExporter, PropertyChange, PropertyValue, RecordingExporter};
pub use observer::{DeviceObserver, ObserverId};
pub use reply::{Reply, Responder};
pub use scan::ScanState;
pub use service::{spawn, HostHandle, HostStatus};
pub use suspend::SuspendResumeState;

/// Crate version, for logs and the CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
