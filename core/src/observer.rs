//! Device lifecycle observers
//!
//! Parties interested in pairing and connection outcomes implement
//! [`DeviceObserver`] and register it with the host. Every callback has an
//! empty default so implementors only override what they need.

use crate::engine::ConnectionId;

pub trait DeviceObserver: Send {
    /// `connected` is the device's link state at the time of the change
    fn on_paired_changed(&mut self, _address: &str, _paired: bool, _connected: bool) {}

    fn on_gatt_connected(&mut self, _address: &str, _conn_id: ConnectionId) {}

    /// A connection attempt ended without a link
    fn on_gatt_connect_failed(&mut self, _address: &str) {}

    /// `intentional` is true when the local side asked for the disconnection
    fn on_gatt_disconnected(&mut self, _address: &str, _conn_id: ConnectionId, _intentional: bool) {}

    fn on_device_removed(&mut self, _address: &str) {}
}

/// Handle returned by [`ObserverList::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registered observers in registration order
#[derive(Default)]
pub struct ObserverList {
    next_id: u64,
    observers: Vec<(ObserverId, Box<dyn DeviceObserver>)>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, observer: Box<dyn DeviceObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.observers.push((id, observer));
        id
    }

    /// Returns false if the id was not registered
    pub fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Call `f` on every observer
    pub fn notify(&mut self, mut f: impl FnMut(&mut dyn DeviceObserver)) {
        for (_, observer) in self.observers.iter_mut() {
            f(observer.as_mut());
        }
    }
}
