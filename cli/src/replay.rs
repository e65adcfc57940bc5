// Scripted replay against the simulated Link Engine
//
// A script is a JSON document holding the engine's stored devices and a list
// of steps. Each step is either a client request or a Link Engine callback;
// all of them go through the host service queue in order. After every step
// the harness records the engine commands that were issued and any held
// replies that resolved.

use anyhow::{Context, Result};
use colored::*;
use lehost_core::{
    spawn, BluetoothError, EngineCommand, EngineEvent, HostConfig, HostController, HostHandle,
    HostResult, HostStatus, KnownDevice, RecordingExporter, Reply, SimFaults, SimulatedEngine,
};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    /// Devices the simulated engine reports as stored
    #[serde(default)]
    pub known_devices: Vec<KnownDevice>,

    /// First connection id handed out by the simulated engine
    #[serde(default)]
    pub first_conn_id: Option<u32>,

    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    StartDiscovery { requester: String },
    StopDiscovery { requester: String },
    ClientVanished { requester: String },
    RemoveDevice { address: String },
    SetAlias { address: String, alias: String },
    SetTrusted { address: String, trusted: bool },
    Pair { address: String },
    CancelPairing { address: String },
    Connect { address: String },
    Disconnect { address: String },
    SuspendImminent,
    SuspendDone,
    SetStackSyncQuitting { quitting: bool },
    /// Deliver a Link Engine callback
    Engine { event: EngineEvent },
    /// Replace the simulated engine's failure switches
    Faults(SimFaults),
    /// Snapshot the host state
    Status,
}

impl Step {
    fn label(&self) -> String {
        match self {
            Self::StartDiscovery { requester } => format!("StartDiscovery from {}", requester),
            Self::StopDiscovery { requester } => format!("StopDiscovery from {}", requester),
            Self::ClientVanished { requester } => format!("{} vanished", requester),
            Self::RemoveDevice { address } => format!("RemoveDevice {}", address),
            Self::SetAlias { address, alias } => format!("SetAlias {} = {:?}", address, alias),
            Self::SetTrusted { address, trusted } => format!("SetTrusted {} = {}", address, trusted),
            Self::Pair { address } => format!("Pair {}", address),
            Self::CancelPairing { address } => format!("CancelPairing {}", address),
            Self::Connect { address } => format!("Connect {}", address),
            Self::Disconnect { address } => format!("Disconnect {}", address),
            Self::SuspendImminent => "HandleSuspendImminent".to_string(),
            Self::SuspendDone => "HandleSuspendDone".to_string(),
            Self::SetStackSyncQuitting { quitting } => {
                format!("StackSyncQuitting = {}", quitting)
            }
            Self::Engine { event } => match event {
                EngineEvent::DeviceDiscovered(report) => format!(
                    "engine: discovered {} rssi {} eir {}",
                    report.address,
                    report.rssi,
                    hex::encode(&report.eir)
                ),
                EngineEvent::PairStateChanged {
                    address,
                    state,
                    error,
                    ..
                } => format!("engine: pairing {} {} ({:?})", address, state, error),
                EngineEvent::GattConnectionStateChanged { conn_id, state } => {
                    format!("engine: conn id {} {:?}", conn_id, state)
                }
            },
            Self::Faults(_) => "set engine faults".to_string(),
            Self::Status => "status".to_string(),
        }
    }
}

/// What happened during one step
#[derive(Debug)]
pub struct StepRecord {
    pub label: String,
    /// Immediate result of a synchronous request
    pub result: Option<HostResult<()>>,
    /// Engine commands issued while the step was handled
    pub commands: Vec<EngineCommand>,
    /// Held replies (label, result) that resolved during the step
    pub replies: Vec<(String, HostResult<()>)>,
    pub status: Option<HostStatus>,
}

#[derive(Debug)]
pub struct ReplayReport {
    pub steps: Vec<StepRecord>,
    /// Held replies still unresolved at the end
    pub pending: Vec<String>,
    pub final_status: HostStatus,
}

pub fn load_script(path: &Path) -> Result<Script> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse script {}", path.display()))
}

/// Run a script to completion on a fresh host
pub async fn run(script: &Script, config: HostConfig) -> Result<ReplayReport> {
    let engine = SimulatedEngine::new().with_known_devices(script.known_devices.clone());
    if let Some(conn_id) = script.first_conn_id {
        engine.set_next_conn_id(conn_id);
    }

    let mut controller = HostController::new(
        engine.clone(),
        Box::new(RecordingExporter::new()),
        config,
    );
    controller.init();
    engine.clear_commands();

    let (handle, task) = spawn(controller);
    info!("Replaying {} step(s)", script.steps.len());

    let mut held: Vec<(String, Reply)> = Vec::new();
    let mut records = Vec::with_capacity(script.steps.len());

    for (index, step) in script.steps.iter().enumerate() {
        let label = step.label();
        debug!("Step {}: {}", index + 1, label);

        let (result, status) = apply(&handle, &engine, step, &label, &mut held).await?;
        handle.flush().await.context("Host service stopped")?;

        let commands = engine.commands();
        engine.clear_commands();

        let mut replies = Vec::new();
        held.retain_mut(|(reply_label, reply)| match reply.try_take() {
            Some(result) => {
                replies.push((reply_label.clone(), result));
                false
            }
            None => true,
        });

        records.push(StepRecord {
            label,
            result,
            commands,
            replies,
            status,
        });
    }

    let final_status = handle.status().await.context("Host service stopped")?;
    handle.shutdown().await.context("Host service stopped")?;
    task.await.context("Host service task failed")?;

    Ok(ReplayReport {
        steps: records,
        pending: held.into_iter().map(|(label, _)| label).collect(),
        final_status,
    })
}

async fn apply(
    handle: &HostHandle,
    engine: &SimulatedEngine,
    step: &Step,
    label: &str,
    held: &mut Vec<(String, Reply)>,
) -> Result<(Option<HostResult<()>>, Option<HostStatus>)> {
    let queued = |r: HostResult<()>| r.context("Host service stopped");

    let result = match step {
        Step::StartDiscovery { requester } => Some(handle.start_discovery(requester).await),
        Step::StopDiscovery { requester } => Some(handle.stop_discovery(requester).await),
        Step::RemoveDevice { address } => Some(handle.remove_device(address).await),
        Step::SetAlias { address, alias } => Some(handle.set_alias(address, alias).await),
        Step::SetTrusted { address, trusted } => Some(handle.set_trusted(address, *trusted).await),
        Step::ClientVanished { requester } => {
            queued(handle.client_vanished(requester).await)?;
            None
        }
        Step::SetStackSyncQuitting { quitting } => {
            queued(handle.set_stack_sync_quitting(*quitting).await)?;
            None
        }
        Step::Engine { event } => {
            queued(handle.engine_event(event.clone()).await)?;
            None
        }
        Step::Faults(faults) => {
            engine.set_faults(*faults);
            None
        }
        Step::Status => {
            let status = handle.status().await.context("Host service stopped")?;
            return Ok((None, Some(status)));
        }
        Step::Pair { address } => {
            held.push((label.to_string(), handle.pair(address).await));
            None
        }
        Step::CancelPairing { address } => {
            held.push((label.to_string(), handle.cancel_pairing(address).await));
            None
        }
        Step::Connect { address } => {
            held.push((label.to_string(), handle.connect(address).await));
            None
        }
        Step::Disconnect { address } => {
            held.push((label.to_string(), handle.disconnect(address).await));
            None
        }
        Step::SuspendImminent => {
            held.push((label.to_string(), handle.suspend_imminent().await));
            None
        }
        Step::SuspendDone => {
            held.push((label.to_string(), handle.suspend_done().await));
            None
        }
    };
    Ok((result, None))
}

fn describe(result: &HostResult<()>) -> ColoredString {
    match result {
        Ok(()) => "ok".green(),
        Err(e) => format_error(e).red(),
    }
}

fn format_error(e: &BluetoothError) -> String {
    if e.message().is_empty() {
        e.dbus_name()
    } else {
        format!("{}: {}", e.dbus_name(), e.message())
    }
}

pub fn print_report(report: &ReplayReport) {
    for (index, step) in report.steps.iter().enumerate() {
        println!("{} {}", format!("[{:>2}]", index + 1).dimmed(), step.label.bold());

        if let Some(result) = &step.result {
            println!("     {} {}", "→".bright_blue(), describe(result));
        }
        for command in &step.commands {
            let json = serde_json::to_string(command).unwrap_or_else(|_| format!("{:?}", command));
            println!("     {} {}", "engine".bright_yellow(), json);
        }
        for (label, result) in &step.replies {
            println!("     {} {} {}", "reply".bright_cyan(), label, describe(result));
        }
        if let Some(status) = &step.status {
            print_status(status);
        }
    }

    println!();
    if report.pending.is_empty() {
        println!("{} Every held reply resolved", "✓".green());
    } else {
        for label in &report.pending {
            println!("{} Still waiting: {}", "!".yellow(), label);
        }
    }
    print_status(&report.final_status);
}

fn print_status(status: &HostStatus) {
    println!("     {}", "Host status".bold());
    println!("       Scan:              {}", status.scan_state.to_string().bright_cyan());
    println!("       Suspend:           {}", status.suspend_state);
    println!("       Discovery clients: {}", status.discovery_clients);
    println!("       Devices:           {}", status.devices);
    println!(
        "       Pairing with:      {}",
        status.pairing_with.as_deref().unwrap_or("-")
    );
    println!("       StackSyncQuitting: {}", status.stack_sync_quitting);
}
