//! Common utilities for acceptance tests.
//!
//! Provides a fully wired cell:
//! - Simulated PLC registers with a PLC-side handshake responder
//! - Scripted scanner
//! - Hand-off files and image directories in a temporary directory
//! - A frozen wall clock at 2024-06-15 09:30

#![allow(dead_code)] // Not every scenario uses every helper

use cell_common::config::CellConfig;
use cell_common::{CellEvent, EventBus, ManualClock, TimestampedEvent};
use cell_fieldbus::{PlcBehaviour, PlcSimulator, RegisterGateway, SimulatedRegisters};
use cell_runtime::{
    CellCommand, CellStore, MemoryStore, Monitor, Orchestrator, ResetListener, ResetSignal,
    COMMAND_CHANNEL_CAPACITY, RESET_CHANNEL_CAPACITY,
};
use cell_scanner::ScriptedScanner;
use chrono::{DateTime, Local, TimeZone};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch};

/// Barcode issued for serial 7 on the frozen date.
pub const BARCODE: &str = "240615XX0007";

/// Wall-clock time every scenario runs at.
pub fn marking_time() -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2024, 6, 15, 9, 30, 0)
        .single()
        .expect("unambiguous local time")
}

/// Cell configuration rooted in `dir`, issuing serial 7 first.
pub fn test_config(dir: &Path) -> CellConfig {
    let mut config = CellConfig::default();
    config.serial.initial = 7;
    config.files.code_file = dir.join("data/code.txt");
    config.files.text_file = dir.join("data/text.txt");
    config.files.camera_dir = dir.join("cameraimage");
    config.files.backup_dir = dir.join("img_backups");
    config.store.path = dir.join("data/records.redb");
    config.scanner.audit_log = None;
    config
}

/// Simulated PLC timing matched to `config`.
pub fn plc_behaviour(config: &CellConfig) -> PlcBehaviour {
    PlcBehaviour {
        final_hold: config.cycle.image_wait + Duration::from_secs(1),
        ..PlcBehaviour::default()
    }
}

/// A wired cell around one orchestrator.
pub struct Cell<S> {
    pub config: CellConfig,
    pub regs: SimulatedRegisters,
    pub gateway: RegisterGateway,
    pub scanner: ScriptedScanner,
    pub store: Arc<S>,
    pub events: EventBus,
    pub clock: ManualClock,
    pub resets: mpsc::Sender<ResetSignal>,
    pub commands: mpsc::Sender<CellCommand>,
    shutdown: watch::Sender<bool>,
    pub dir: TempDir,
}

impl Cell<MemoryStore> {
    /// Cell on an in-memory store, stopping after `iterations` iterations.
    pub fn in_memory(iterations: u64) -> (Self, Orchestrator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let store = Arc::new(MemoryStore::new(config.settings.clone()));
        Self::build(dir, config, store, iterations)
    }
}

impl<S: CellStore + 'static> Cell<S> {
    /// Wire a cell around `store`.
    pub fn build(dir: TempDir, config: CellConfig, store: Arc<S>, iterations: u64) -> (Self, Orchestrator) {
        let regs = SimulatedRegisters::new();
        let gateway = RegisterGateway::new(Arc::new(regs.clone()), config.plc.write_timeout);
        let scanner = ScriptedScanner::new();
        let events = EventBus::new(256);
        let clock = ManualClock::new(marking_time());
        let (resets, listener) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let orchestrator = Orchestrator::builder(
            config.clone(),
            gateway.clone(),
            Arc::new(scanner.clone()),
            Arc::clone(&store) as Arc<dyn CellStore>,
        )
        .events(events.clone())
        .clock(Arc::new(clock.clone()))
        .resets(listener)
        .commands(command_rx)
        .iteration_limit(iterations)
        .build();

        let cell = Self {
            config,
            regs,
            gateway,
            scanner,
            store,
            events,
            clock,
            resets,
            commands,
            shutdown,
            dir,
        };
        (cell, orchestrator)
    }

    /// Start the simulated PLC.
    pub fn start_plc(&self, behaviour: PlcBehaviour) -> PlcSimulator {
        let simulator = PlcSimulator::new(self.regs.clone(), self.config.plc.map.clone(), behaviour);
        tokio::spawn(simulator.clone().run(self.shutdown.subscribe()));
        simulator
    }

    /// Start the reset and alarm pollers.
    pub fn start_monitor(&self) -> Monitor {
        Monitor::spawn(&self.gateway, &self.config, self.resets.clone(), &self.events)
    }

    /// Shutdown receiver that stays low for the life of the cell.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Drop a camera image named after `pattern` into the camera directory.
    pub fn place_image(&self, pattern: &str) {
        let dir = &self.config.files.camera_dir;
        std::fs::create_dir_all(dir).expect("camera dir");
        std::fs::write(dir.join(format!("cam_{pattern}_1.bmp")), b"image").expect("image");
    }

    /// Whether a PLC flag is set.
    pub fn flag(&self, address: cell_common::RegisterAddress) -> bool {
        self.regs.bit(address.register, address.bit)
    }
}

/// Wait until an event named `name` is published.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<TimestampedEvent>,
    name: &str,
) -> CellEvent {
    loop {
        match rx.recv().await {
            Ok(event) if event.event.name() == name => return event.event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => panic!("event bus closed before {name}"),
        }
    }
}

/// Every event already published, by name.
pub fn drain_event_names(rx: &mut broadcast::Receiver<TimestampedEvent>) -> Vec<String> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|e| e.event.name().to_string())
        .collect()
}
