//! Error taxonomy surfaced to clients
//!
//! Every failure a caller can observe is one of the [`BluetoothError`]
//! variants below. Raw Link Engine codes never cross this boundary: they are
//! translated where they are detected (see [`crate::pairing::map_pair_error`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every client-visible error name.
pub const ERROR_DOMAIN: &str = "org.bluez.Error";

/// Errors returned to clients of the adapter and device objects
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BluetoothError {
    #[error("Operation in progress: {0}")]
    InProgress(String),

    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Does not exist: {0}")]
    DoesNotExist(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Authentication canceled: {0}")]
    AuthenticationCanceled(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Authentication timeout: {0}")]
    AuthenticationTimeout(String),
}

impl BluetoothError {
    /// Short kind name, e.g. `InProgress`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InProgress(_) => "InProgress",
            Self::Failed(_) => "Failed",
            Self::DoesNotExist(_) => "DoesNotExist",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::NotConnected(_) => "NotConnected",
            Self::InvalidArguments(_) => "InvalidArguments",
            Self::AuthenticationCanceled(_) => "AuthenticationCanceled",
            Self::AuthenticationFailed(_) => "AuthenticationFailed",
            Self::AuthenticationTimeout(_) => "AuthenticationTimeout",
        }
    }

    /// Fully qualified error name as seen by remote clients
    pub fn dbus_name(&self) -> String {
        format!("{}.{}", ERROR_DOMAIN, self.kind())
    }

    /// Human readable message attached to the error
    pub fn message(&self) -> &str {
        match self {
            Self::InProgress(m)
            | Self::Failed(m)
            | Self::DoesNotExist(m)
            | Self::AlreadyExists(m)
            | Self::NotConnected(m)
            | Self::InvalidArguments(m)
            | Self::AuthenticationCanceled(m)
            | Self::AuthenticationFailed(m)
            | Self::AuthenticationTimeout(m) => m,
        }
    }

    /// True if both errors are of the same kind, ignoring the message
    pub fn same_kind(&self, other: &BluetoothError) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Result alias used by every synchronous client call
pub type HostResult<T> = Result<T, BluetoothError>;
