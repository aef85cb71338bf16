//! Laser-marking cell daemon entry point.
//!
//! Connects the PLC and the scanner, opens the results store, and runs the
//! scan loop with its reset and alarm pollers until a shutdown signal.

mod signals;
mod simulated;

use anyhow::{Context, Result};
use cell_common::config::CellConfig;
use cell_common::{CellEvent, EventBus, TimestampedEvent};
use cell_fieldbus::{
    ModbusTcpClient, ModbusTcpConfig, PlcBehaviour, PlcSimulator, RegisterGateway, RegisterTransport,
    SimulatedRegisters,
};
use cell_runtime::{
    open_with_retry, CellCommand, CellStore, MemoryStore, Monitor, Orchestrator, RedbStore,
    ResetListener, COMMAND_CHANNEL_CAPACITY, RESET_CHANNEL_CAPACITY,
};
use cell_scanner::{ScannerClient, ScannerPort};
use chrono::Timelike;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::signals::SignalHandler;
use crate::simulated::CodeFileScanner;

/// Cell daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "cell-daemon",
    about = "Laser-marking cell daemon - PLC handshake, marking hand-off, and verification",
    version,
    long_about = None
)]
struct Args {
    /// Path to a cell configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run against a simulated PLC and scanner with an in-memory store.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Maximum scan-loop iterations (0 = infinite).
    #[arg(long, default_value = "0")]
    max_cycles: u64,

    /// Log level (trace, debug, info, warn, error). Falls back to `LOG_LEVEL`.
    #[arg(long, short = 'l')]
    log_level: Option<String>,
}

impl Args {
    fn effective_log_level(&self) -> String {
        self.log_level
            .clone()
            .or_else(|| std::env::var("LOG_LEVEL").ok())
            .unwrap_or_else(|| "info".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.effective_log_level());

    info!(version = env!("CARGO_PKG_VERSION"), "Starting cell daemon");

    let (config, config_path) = load_config(&args)?;
    info!(
        plc = %config.plc.address,
        scanner = %config.scanner.address,
        step_timeout = ?config.cycle.step_timeout,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::install().context("Failed to set up signal handlers")?;

    run_daemon(config, config_path, &args, signal_handler).await
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "cell_daemon={level},cell_runtime={level},cell_fieldbus={level},cell_scanner={level},cell_marking={level},cell_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `CELL_CONFIG_PATH` environment variable
/// 3. `/etc/laser-cell/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
///
/// The path is returned so SIGHUP can re-read the same file.
fn load_config(args: &Args) -> Result<(CellConfig, Option<PathBuf>)> {
    // 1. Command-line argument (highest priority)
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        let config = CellConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"))?;
        return Ok((config, Some(config_path.clone())));
    }

    // 2. Environment variable
    if let Ok(env_path) = std::env::var("CELL_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from CELL_CONFIG_PATH");
            let config = CellConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from CELL_CONFIG_PATH={env_path:?}")
            })?;
            return Ok((config, Some(config_path)));
        }
        warn!(
            path = %env_path,
            "CELL_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    // 3. System path, then 4. local development path
    for candidate in ["/etc/laser-cell/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(candidate);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            let config = CellConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"))?;
            return Ok((config, Some(config_path)));
        }
    }

    // 5. Built-in defaults
    info!("No config file found, using built-in defaults");
    Ok((CellConfig::default(), None))
}

/// Connected PLC transport and scanner.
struct Devices {
    transport: Arc<dyn RegisterTransport>,
    scanner: Arc<dyn ScannerPort>,
    simulator: Option<PlcSimulator>,
}

/// Open the PLC and scanner connections. A refused connection is fatal.
async fn connect_devices(config: &CellConfig, simulated: bool) -> Result<Devices> {
    if simulated {
        info!("Using simulated PLC and scanner");
        let regs = SimulatedRegisters::new();
        let behaviour = PlcBehaviour {
            final_hold: config.cycle.image_wait + config.cycle.poll_interval * 10,
            ..PlcBehaviour::default()
        };
        let simulator = PlcSimulator::new(regs.clone(), config.plc.map.clone(), behaviour);
        return Ok(Devices {
            transport: Arc::new(regs),
            scanner: Arc::new(CodeFileScanner::new(&config.files.code_file, &config.files.camera_dir)),
            simulator: Some(simulator),
        });
    }

    let plc = ModbusTcpClient::new(ModbusTcpConfig::from(&config.plc));
    plc.connect()
        .await
        .with_context(|| format!("Failed to connect to PLC at {}", config.plc.address))?;
    info!(address = %config.plc.address, "PLC connected");

    let scanner = ScannerClient::from_config(&config.scanner);
    scanner
        .connect()
        .await
        .with_context(|| format!("Failed to connect to scanner at {}", config.scanner.address))?;
    info!(address = %config.scanner.address, "Scanner connected");

    Ok(Devices {
        transport: Arc::new(plc),
        scanner: Arc::new(scanner),
        simulator: None,
    })
}

/// Open the results store, retrying while the database is unavailable.
async fn open_store(config: &CellConfig, simulated: bool) -> Result<Arc<dyn CellStore>> {
    if simulated {
        info!("Using in-memory results store");
        return Ok(Arc::new(MemoryStore::new(config.settings.clone())));
    }
    let path = config.store.path.clone();
    let seed = config.settings.clone();
    let store = open_with_retry(config.store.connect_attempts, config.store.connect_delay, || {
        RedbStore::open(&path, &seed)
    })
    .await
    .with_context(|| format!("Failed to open results store {path:?}"))?;
    info!(?path, "Results store opened");
    Ok(Arc::new(store))
}

/// Main daemon run loop.
async fn run_daemon(
    config: CellConfig,
    config_path: Option<PathBuf>,
    args: &Args,
    mut signal_handler: SignalHandler,
) -> Result<()> {
    let events = EventBus::default();
    let event_logger = tokio::spawn(log_events(events.subscribe()));

    let devices = connect_devices(&config, args.simulated).await?;
    let store = open_store(&config, args.simulated).await?;
    let shutdown = signal_handler.state().subscribe();

    let simulator = devices
        .simulator
        .map(|sim| tokio::spawn(sim.run(shutdown.clone())));

    let gateway = RegisterGateway::new(Arc::clone(&devices.transport), config.plc.write_timeout);
    let (reset_tx, resets) = ResetListener::channel(RESET_CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let monitor = Monitor::spawn(&gateway, &config, reset_tx, &events);

    let reloader = signal_handler
        .take_reloads()
        .map(|reloads| tokio::spawn(handle_reloads(reloads, config_path, command_tx)));

    let mut builder = Orchestrator::builder(
        config,
        gateway,
        Arc::clone(&devices.scanner),
        Arc::clone(&store),
    )
    .events(events.clone())
    .resets(resets)
    .commands(command_rx);
    if args.max_cycles > 0 {
        builder = builder.iteration_limit(args.max_cycles);
    }
    let mut orchestrator = builder.build();
    orchestrator
        .initialize()
        .await
        .context("Failed to restore counters from the results store")?;

    let stats = orchestrator.run(shutdown).await;

    // Graceful shutdown
    info!("Shutting down...");
    signal_handler.state().request_shutdown();

    monitor.shutdown().await;
    orchestrator.clear_handshake().await;

    // `run` has already closed a record left pending by the dropped iteration.
    if let Err(e) = store.close().await {
        warn!(error = %e, "Store close failed");
    }
    devices.scanner.close().await;
    if let Err(e) = devices.transport.shutdown().await {
        warn!(error = %e, "PLC shutdown failed");
    }

    if let Some(reloader) = reloader {
        reloader.abort();
    }
    if let Some(simulator) = simulator {
        let _ = simulator.await;
    }
    event_logger.abort();

    info!(
        total_cycles = stats.cycle_count(),
        iterations = stats.iterations(),
        aborted_reset = stats.aborted_reset,
        aborted_timeout = stats.aborted_timeout,
        failures = stats.failures,
        next_serial = orchestrator.serial().current(),
        signals = signal_handler.state().signal_count(),
        "Daemon shutdown complete"
    );

    Ok(())
}

/// Commands that bring the counters in line with a reloaded configuration.
fn reload_commands(config: &CellConfig) -> [CellCommand; 2] {
    let reset_time = config.serial.reset_time;
    [
        CellCommand::UpdateResetTime {
            hour: reset_time.hour(),
            minute: reset_time.minute(),
        },
        CellCommand::UpdateInitialSerial {
            value: config.serial.initial,
        },
    ]
}

/// Re-read the configuration file on SIGHUP and forward the counter settings.
async fn handle_reloads(
    mut reloads: mpsc::Receiver<()>,
    config_path: Option<PathBuf>,
    commands: mpsc::Sender<CellCommand>,
) {
    while reloads.recv().await.is_some() {
        let Some(path) = &config_path else {
            warn!("Reload requested but the daemon runs on built-in defaults");
            continue;
        };
        let config = match CellConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(?path, error = %e, "Config reload failed, keeping current settings");
                continue;
            }
        };
        for command in reload_commands(&config) {
            if commands.send(command).await.is_err() {
                return;
            }
        }
        info!(?path, "Config reloaded");
    }
}

/// Mirror published events into the log.
async fn log_events(mut rx: broadcast::Receiver<TimestampedEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event.event {
                CellEvent::Alarm { name, address, message } => {
                    warn!(alarm = %name, %address, %message, "Alarm");
                }
                CellEvent::ImageSaveError { message, path } => {
                    warn!(%path, %message, "Image save error");
                }
                _ => match serde_json::to_string(&event) {
                    Ok(json) => debug!(event = %json, "Event"),
                    Err(e) => warn!(error = %e, "Event not serializable"),
                },
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
