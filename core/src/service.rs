//! Host service task
//!
//! Moves a [`HostController`] into a single tokio task. Client requests and
//! Link Engine callbacks are queued as [`HostCommand`]s on one channel and
//! handled strictly in arrival order, one at a time. [`HostHandle`] is the
//! cloneable front used by the transport layer.

use crate::adapter::HostController;
use crate::engine::{EngineEvent, LinkEngine};
use crate::error::{BluetoothError, HostResult};
use crate::reply::{channel, Reply, Responder};
use crate::scan::ScanState;
use crate::suspend::SuspendResumeState;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Queue depth between the handle and the host task
pub const HOST_CHANNEL_CAPACITY: usize = 256;

/// Work item for the host task
#[derive(Debug)]
pub enum HostCommand {
    StartDiscovery {
        requester: String,
        reply: oneshot::Sender<HostResult<()>>,
    },
    StopDiscovery {
        requester: String,
        reply: oneshot::Sender<HostResult<()>>,
    },
    RemoveDevice {
        address: String,
        reply: oneshot::Sender<HostResult<()>>,
    },
    Pair {
        address: String,
        reply: Responder,
    },
    CancelPairing {
        address: String,
        reply: Responder,
    },
    Connect {
        address: String,
        reply: Responder,
    },
    Disconnect {
        address: String,
        reply: Responder,
    },
    SetAlias {
        address: String,
        alias: String,
        reply: oneshot::Sender<HostResult<()>>,
    },
    SetTrusted {
        address: String,
        trusted: bool,
        reply: oneshot::Sender<HostResult<()>>,
    },
    SuspendImminent {
        reply: Responder,
    },
    SuspendDone {
        reply: Responder,
    },
    SetStackSyncQuitting(bool),
    /// A requester dropped off the bus
    ClientVanished(String),
    /// A Link Engine callback
    Engine(EngineEvent),
    Status {
        reply: oneshot::Sender<HostStatus>,
    },
    /// Answered once every earlier command has been handled
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Point-in-time summary of the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub scan_state: ScanState,
    pub suspend_state: SuspendResumeState,
    pub discovery_clients: usize,
    pub devices: usize,
    pub pairing_with: Option<String>,
    pub stack_sync_quitting: bool,
}

/// Start the host task. Call [`HostController::init`] before handing the
/// controller over. The task returns the controller when it stops.
pub fn spawn<E>(controller: HostController<E>) -> (HostHandle, JoinHandle<HostController<E>>)
where
    E: LinkEngine + 'static,
{
    let (command_tx, mut command_rx) = mpsc::channel(HOST_CHANNEL_CAPACITY);

    let task = tokio::spawn(async move {
        let mut controller = controller;
        info!("Host service started");

        while let Some(command) = command_rx.recv().await {
            if !handle_command(&mut controller, command) {
                break;
            }
        }

        info!("Host service stopped");
        controller
    });

    (HostHandle { command_tx }, task)
}

/// Returns false when the task should stop
fn handle_command<E: LinkEngine>(host: &mut HostController<E>, command: HostCommand) -> bool {
    match command {
        HostCommand::StartDiscovery { requester, reply } => {
            let _ = reply.send(host.start_discovery(&requester));
        }
        HostCommand::StopDiscovery { requester, reply } => {
            let _ = reply.send(host.stop_discovery(&requester));
        }
        HostCommand::RemoveDevice { address, reply } => {
            let _ = reply.send(host.remove_device(&address));
        }
        HostCommand::Pair { address, reply } => host.pair(&address, reply),
        HostCommand::CancelPairing { address, reply } => host.cancel_pairing(&address, reply),
        HostCommand::Connect { address, reply } => host.connect(&address, reply),
        HostCommand::Disconnect { address, reply } => host.disconnect(&address, reply),
        HostCommand::SetAlias {
            address,
            alias,
            reply,
        } => {
            let _ = reply.send(host.set_alias(&address, &alias));
        }
        HostCommand::SetTrusted {
            address,
            trusted,
            reply,
        } => {
            let _ = reply.send(host.set_trusted(&address, trusted));
        }
        HostCommand::SuspendImminent { reply } => host.suspend_imminent(reply),
        HostCommand::SuspendDone { reply } => host.suspend_done(reply),
        HostCommand::SetStackSyncQuitting(quitting) => host.set_stack_sync_quitting(quitting),
        HostCommand::ClientVanished(requester) => host.client_vanished(&requester),
        HostCommand::Engine(event) => host.handle_engine_event(event),
        HostCommand::Status { reply } => {
            let _ = reply.send(HostStatus {
                scan_state: host.scan_state(),
                suspend_state: host.suspend_state(),
                discovery_clients: host.discovery_client_count(),
                devices: host.registry().len(),
                pairing_with: host.pairing().target().map(str::to_string),
                stack_sync_quitting: host.stack_sync_quitting(),
            });
        }
        HostCommand::Flush { reply } => {
            let _ = reply.send(());
        }
        HostCommand::Shutdown => {
            debug!("Host service shutdown requested");
            return false;
        }
    }
    true
}

fn stopped() -> BluetoothError {
    BluetoothError::Failed("Host service not running".to_string())
}

/// Cloneable front of the host task
#[derive(Debug, Clone)]
pub struct HostHandle {
    command_tx: mpsc::Sender<HostCommand>,
}

impl HostHandle {
    async fn call(
        &self,
        build: impl FnOnce(oneshot::Sender<HostResult<()>>) -> HostCommand,
    ) -> HostResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())?
    }

    /// Queue a command whose answer arrives on a held [`Reply`]. If the task
    /// is gone the responder is dropped and the reply resolves as failed.
    async fn call_held(
        &self,
        method: &'static str,
        build: impl FnOnce(Responder) -> HostCommand,
    ) -> Reply {
        let (responder, reply) = channel(method);
        let _ = self.command_tx.send(build(responder)).await;
        reply
    }

    pub async fn start_discovery(&self, requester: &str) -> HostResult<()> {
        let requester = requester.to_string();
        self.call(|reply| HostCommand::StartDiscovery { requester, reply })
            .await
    }

    pub async fn stop_discovery(&self, requester: &str) -> HostResult<()> {
        let requester = requester.to_string();
        self.call(|reply| HostCommand::StopDiscovery { requester, reply })
            .await
    }

    pub async fn remove_device(&self, address: &str) -> HostResult<()> {
        let address = address.to_string();
        self.call(|reply| HostCommand::RemoveDevice { address, reply })
            .await
    }

    pub async fn set_alias(&self, address: &str, alias: &str) -> HostResult<()> {
        let address = address.to_string();
        let alias = alias.to_string();
        self.call(|reply| HostCommand::SetAlias {
            address,
            alias,
            reply,
        })
        .await
    }

    pub async fn set_trusted(&self, address: &str, trusted: bool) -> HostResult<()> {
        let address = address.to_string();
        self.call(|reply| HostCommand::SetTrusted {
            address,
            trusted,
            reply,
        })
        .await
    }

    pub async fn pair(&self, address: &str) -> Reply {
        let address = address.to_string();
        self.call_held("Pair", |reply| HostCommand::Pair { address, reply })
            .await
    }

    pub async fn cancel_pairing(&self, address: &str) -> Reply {
        let address = address.to_string();
        self.call_held("CancelPairing", |reply| HostCommand::CancelPairing {
            address,
            reply,
        })
        .await
    }

    pub async fn connect(&self, address: &str) -> Reply {
        let address = address.to_string();
        self.call_held("Connect", |reply| HostCommand::Connect { address, reply })
            .await
    }

    pub async fn disconnect(&self, address: &str) -> Reply {
        let address = address.to_string();
        self.call_held("Disconnect", |reply| HostCommand::Disconnect {
            address,
            reply,
        })
        .await
    }

    pub async fn suspend_imminent(&self) -> Reply {
        self.call_held("HandleSuspendImminent", |reply| {
            HostCommand::SuspendImminent { reply }
        })
        .await
    }

    pub async fn suspend_done(&self) -> Reply {
        self.call_held("HandleSuspendDone", |reply| HostCommand::SuspendDone {
            reply,
        })
        .await
    }

    pub async fn set_stack_sync_quitting(&self, quitting: bool) -> HostResult<()> {
        self.command_tx
            .send(HostCommand::SetStackSyncQuitting(quitting))
            .await
            .map_err(|_| stopped())
    }

    /// Release the discovery vote of a requester that went away
    pub async fn client_vanished(&self, requester: &str) -> HostResult<()> {
        self.command_tx
            .send(HostCommand::ClientVanished(requester.to_string()))
            .await
            .map_err(|_| stopped())
    }

    /// Deliver a Link Engine callback
    pub async fn engine_event(&self, event: EngineEvent) -> HostResult<()> {
        self.command_tx
            .send(HostCommand::Engine(event))
            .await
            .map_err(|_| stopped())
    }

    pub async fn status(&self) -> HostResult<HostStatus> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(HostCommand::Status { reply: reply_tx })
            .await
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())
    }

    /// Wait until every command queued before this call has been handled
    pub async fn flush(&self) -> HostResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(HostCommand::Flush { reply: reply_tx })
            .await
            .map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())
    }

    pub async fn shutdown(&self) -> HostResult<()> {
        self.command_tx
            .send(HostCommand::Shutdown)
            .await
            .map_err(|_| stopped())
    }
}
