//! Pairing coordinator
//!
//! The stack runs at most one pairing at a time, process wide. The open
//! attempt is a [`PairSession`] holding the Pair reply and, once requested,
//! the CancelPairing reply. Both are resolved exactly once when the Link
//! Engine reports a terminal state or the device is removed.

use crate::device::{appearance_category, Device};
use crate::engine::{LinkEngine, PairError, PairState, SecurityRequirements};
use crate::error::BluetoothError;
use crate::reply::Responder;
use tracing::{debug, error, info, warn};

// ============================================================================
// STATE
// ============================================================================

/// The open pairing attempt
#[derive(Debug)]
pub struct PairSession {
    pub address: String,
    pair_reply: Responder,
    cancel_reply: Option<Responder>,
}

/// Global pairing state
#[derive(Debug, Default)]
pub enum PairingState {
    #[default]
    Idle,
    Active(PairSession),
}

// ============================================================================
// TRANSLATION TABLES
// ============================================================================

/// Translate a security manager error code. `None` means the code is not a
/// failure from the client's point of view (already paired).
pub fn map_pair_error(code: PairError) -> Option<BluetoothError> {
    let err = match code {
        PairError::None | PairError::AlreadyPaired => return None,
        PairError::InProgress => BluetoothError::InProgress("Pairing in progress".to_string()),
        PairError::InvalidPairReq => {
            BluetoothError::InvalidArguments("Invalid pairing request".to_string())
        }
        PairError::L2cConn | PairError::NoSuchDevice => {
            BluetoothError::DoesNotExist("Pairing failed".to_string())
        }
        PairError::PasskeyFailed
        | PairError::OobNotAvailable
        | PairError::AuthReqInfeasible
        | PairError::ConfValueMismatched
        | PairError::PairingNotSupported
        | PairError::EncrKeySize
        | PairError::RepeatedAttempt
        | PairError::InvalidParam
        | PairError::UnexpectedSmCmd
        | PairError::SendSmCmd
        | PairError::EncrConn
        | PairError::UnexpectedL2cEvt => {
            BluetoothError::AuthenticationFailed("Pairing failed".to_string())
        }
        PairError::Stalled => BluetoothError::AuthenticationTimeout("Pairing failed".to_string()),
        PairError::Memory | PairError::Unknown => {
            BluetoothError::Failed("Pairing failed".to_string())
        }
    };
    Some(err)
}

/// New value of the `paired` property for a pairing callback, if any
pub fn paired_transition(state: PairState, code: PairError) -> Option<bool> {
    match state {
        PairState::Paired => Some(true),
        PairState::NotPaired => Some(false),
        // The security manager reports re-pairing a bonded device this way.
        PairState::Failed => Some(code == PairError::AlreadyPaired),
        PairState::Started | PairState::Canceled => None,
    }
}

/// Pairing security derived from the GAP appearance
pub fn security_requirements(appearance: u16) -> SecurityRequirements {
    let bond_mitm = SecurityRequirements {
        bond: true,
        mitm: true,
    };
    let bond_only = SecurityRequirements {
        bond: true,
        mitm: false,
    };

    match appearance_category(appearance) {
        // phone, computer
        0x01 | 0x02 => bond_mitm,
        // watch
        0x03 => bond_only,
        // HID
        0x0f => match appearance & 0x3f {
            // keyboard, tablet
            0x01 | 0x05 => bond_mitm,
            // mouse, joystick, gamepad
            0x02..=0x04 => bond_only,
            _ => default_security(appearance),
        },
        _ => default_security(appearance),
    }
}

fn default_security(appearance: u16) -> SecurityRequirements {
    warn!(
        "Default security level (bond: true, MITM: false) used for appearance {:#06x}",
        appearance
    );
    SecurityRequirements {
        bond: true,
        mitm: false,
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

#[derive(Debug, Default)]
pub struct PairingCoordinator {
    state: PairingState,
}

impl PairingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, PairingState::Active(_))
    }

    /// Address of the open pairing attempt
    pub fn target(&self) -> Option<&str> {
        match &self.state {
            PairingState::Idle => None,
            PairingState::Active(session) => Some(&session.address),
        }
    }

    pub fn has_pending_cancel(&self) -> bool {
        matches!(&self.state, PairingState::Active(s) if s.cancel_reply.is_some())
    }

    /// Handle Pair. Rejections resolve `reply` right away; otherwise the
    /// session is opened and resolved by a later callback.
    pub fn pair(
        &mut self,
        device: Option<&Device>,
        address: &str,
        engine: &mut dyn LinkEngine,
        reply: Responder,
    ) {
        if let PairingState::Active(session) = &self.state {
            warn!(
                "Pair {} rejected, pairing with {} in progress",
                address, session.address
            );
            reply.reply_err(BluetoothError::InProgress("Pairing in progress".to_string()));
            return;
        }

        let Some(device) = device else {
            reply.reply_err(BluetoothError::DoesNotExist(format!("Unknown device {}", address)));
            return;
        };

        let security = security_requirements(*device.appearance.value());
        if let Err(e) = engine.pair(&device.address, device.is_random_address, security) {
            error!("Link engine refused to pair {}: {}", address, e);
            reply.reply_err(BluetoothError::Failed("Unknown device".to_string()));
            return;
        }

        info!("Pairing with {} (bond: {}, MITM: {})", address, security.bond, security.mitm);
        self.state = PairingState::Active(PairSession {
            address: address.to_string(),
            pair_reply: reply,
            cancel_reply: None,
        });
    }

    /// Handle CancelPairing for `device`
    pub fn cancel(
        &mut self,
        device: Option<&Device>,
        address: &str,
        engine: &mut dyn LinkEngine,
        reply: Responder,
    ) {
        let session = match &mut self.state {
            PairingState::Active(session) if session.address == address => session,
            _ => {
                reply.reply_err(BluetoothError::DoesNotExist("No ongoing pairing".to_string()));
                return;
            }
        };

        if session.cancel_reply.is_some() {
            reply.reply_err(BluetoothError::InProgress(
                "Pairing cancellation in progress".to_string(),
            ));
            return;
        }

        let accepted = match device {
            Some(device) => engine
                .cancel_pair(&device.address, device.is_random_address)
                .map_err(|e| error!("Link engine refused to cancel pairing {}: {}", address, e))
                .is_ok(),
            None => false,
        };
        if !accepted {
            reply.reply_err(BluetoothError::Failed("Unknown device".to_string()));
            return;
        }

        debug!("Cancel pairing requested for {}", address);
        session.cancel_reply = Some(reply);
    }

    /// Resolve held replies for a pairing callback. Callbacks for a device
    /// other than the session target, or with no session, only affect
    /// device state and are handled by the caller.
    pub fn on_pair_state_changed(&mut self, address: &str, state: PairState, code: PairError) {
        match &self.state {
            PairingState::Active(session) if session.address == address => {}
            _ => return,
        }

        if state == PairState::Started {
            debug!("Pairing with {} started", address);
            return;
        }

        let PairingState::Active(session) = std::mem::take(&mut self.state) else {
            return;
        };
        let PairSession {
            pair_reply,
            cancel_reply,
            ..
        } = session;

        match state {
            PairState::Paired => {
                info!("Paired with {}", address);
                pair_reply.reply_ok();
                if let Some(cancel) = cancel_reply {
                    cancel.reply_err(BluetoothError::Failed(
                        "Unknown - pairing done".to_string(),
                    ));
                }
            }
            PairState::Canceled => {
                info!("Pairing with {} canceled", address);
                pair_reply.reply_err(BluetoothError::AuthenticationCanceled(
                    "Pairing canceled".to_string(),
                ));
                if let Some(cancel) = cancel_reply {
                    cancel.reply_ok();
                }
            }
            PairState::Failed => match map_pair_error(code) {
                None => {
                    info!("{} was already paired", address);
                    pair_reply.reply_ok();
                    if let Some(cancel) = cancel_reply {
                        cancel.reply_err(BluetoothError::Failed(
                            "Unknown - pairing done".to_string(),
                        ));
                    }
                }
                Some(err) => {
                    warn!("Pairing with {} failed: {:?}", address, code);
                    pair_reply.reply_err(err);
                    if let Some(cancel) = cancel_reply {
                        cancel.reply_err(BluetoothError::DoesNotExist(
                            "No ongoing pairing".to_string(),
                        ));
                    }
                }
            },
            PairState::NotPaired => {
                warn!("Pairing with {} fell back to not paired", address);
                pair_reply.reply_err(BluetoothError::Failed("Unknown".to_string()));
                if let Some(cancel) = cancel_reply {
                    cancel.reply_err(BluetoothError::DoesNotExist(
                        "No ongoing pairing".to_string(),
                    ));
                }
            }
            PairState::Started => {}
        }
    }

    /// Tear down the session for a device being removed. Returns true if a
    /// session was open for it.
    pub fn cancel_for_removal(&mut self, device: &Device, engine: &mut dyn LinkEngine) -> bool {
        match &self.state {
            PairingState::Active(session) if session.address == device.address => {}
            _ => return false,
        }

        if let Err(e) = engine.cancel_pair(&device.address, device.is_random_address) {
            error!("Failed to cancel pairing with removed device {}: {}", device.address, e);
        }

        if let PairingState::Active(session) = std::mem::take(&mut self.state) {
            info!("Pairing with {} canceled by removal", session.address);
            session.pair_reply.reply_err(BluetoothError::AuthenticationCanceled(
                "Device removed".to_string(),
            ));
            if let Some(cancel) = session.cancel_reply {
                cancel.reply_ok();
            }
        }
        true
    }
}
