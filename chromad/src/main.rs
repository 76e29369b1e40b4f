//! # chromad
//!
//! The controller daemon. Wires the simulation HAL to the control core,
//! spawns the control and step-timer tasks, runs the serial command
//! link when a device is configured, and serves the HTTP front-end.
//!
//! Task layout mirrors the firmware: a high-priority 10 ms control task
//! owns every controller, three step-timer tasks emit pulses at the
//! delays the controllers return, and the communication task only
//! touches atomic setpoint cells.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chroma_common::config::{ChromaConfig, ConfigError, ConfigLoader, LogLevel};
use chroma_common::state::DeviceState;
use chroma_common::storage::{self, StoragePaths};
use chroma_control::cycle::{spawn_control_loop, spawn_pump_stepper, spawn_valve};
use chroma_control::handle::{DeviceHandle, PumpSetpointCell, ValveRequestCell};
use chroma_control::{
    ControlLoop, Device, ProgramExecutor, PumpControl, PumpShared, PumpStepper, RadialValve,
    ValveHandle, ValveShared,
};
use chroma_hal::sim::{SimPin, SimSwitch};
use chroma_link::{open_serial, run_link, Dispatcher};
use chroma_server::AppState;
use clap::Parser;
use parking_lot::RwLock;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "chromad", about = "Liquid-chromatography controller daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/chroma.toml")]
    config: PathBuf,

    /// Override the serial device for the command link.
    #[arg(long)]
    serial: Option<String>,

    /// Override the HTTP bind address.
    #[arg(long)]
    http_bind: Option<String>,
}

fn load_config(args: &Args) -> Result<ChromaConfig, ConfigError> {
    let mut config = match ChromaConfig::load(&args.config) {
        Ok(config) => config,
        Err(ConfigError::FileNotFound) => {
            eprintln!(
                "no config at {}; using built-in defaults",
                args.config.display()
            );
            ChromaConfig::default()
        }
        Err(e) => return Err(e),
    };
    if let Some(serial) = &args.serial {
        config.link.serial_device = Some(serial.clone());
    }
    if let Some(bind) = &args.http_bind {
        config.http.bind_addr = bind.clone();
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(level: LogLevel) {
    let max_level = match level {
        LogLevel::Trace => tracing::Level::TRACE,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(max_level)
        .init();
}

fn main() {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(config.shared.log_level);
    info!(device = %config.shared.device_name, "chromad starting");

    // ── Persistence ─────────────────────────────────────────────────
    let paths = Arc::new(StoragePaths::from_config(&config.storage));
    let program = Arc::new(RwLock::new(storage::load_program(&paths.program)));
    let reagent_names = Arc::new(RwLock::new(storage::load_names(
        &paths.reagent_names,
        "Reagent",
    )));
    let column_names = Arc::new(RwLock::new(storage::load_names(
        &paths.column_names,
        "Column",
    )));

    // ── Controllers over the simulation HAL ─────────────────────────
    // Limit switches start asserted so the first homing run completes
    // immediately on a host without real hardware.
    let pump_shared = PumpShared::new();
    let pump = PumpControl::new(&config.pump, pump_shared.clone());
    let pump_stepper = PumpStepper::new(
        &config.pump,
        pump_shared,
        SimPin::new(),
        SimPin::new(),
        SimPin::new(),
    );

    let reagent_shared = ValveShared::new();
    let reagent_valve = RadialValve::new(
        &config.reagent_valve,
        reagent_shared.clone(),
        SimPin::new(),
        SimPin::new(),
        SimPin::new(),
        SimSwitch::new(true),
    );
    let column_shared = ValveShared::new();
    let column_valve = RadialValve::new(
        &config.column_valve,
        column_shared.clone(),
        SimPin::new(),
        SimPin::new(),
        SimPin::new(),
        SimSwitch::new(true),
    );

    // ── Control core ────────────────────────────────────────────────
    let published = Arc::new(RwLock::new(DeviceState::default()));
    let device = Device::new(
        pump,
        ValveHandle::new(reagent_shared),
        ValveHandle::new(column_shared),
        published.clone(),
    );
    let (executor, executor_handle) = ProgramExecutor::new(program.clone());

    let pump_cell = PumpSetpointCell::new();
    let valve_cell = ValveRequestCell::new();
    let device_handle = DeviceHandle::new(pump_cell.clone(), valve_cell.clone(), published);
    let control = ControlLoop::new(device, executor, pump_cell, valve_cell);

    // ── Tasks ───────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let control_task = spawn_control_loop(control, shutdown.clone())
        .unwrap_or_else(|e| fatal(&format!("control task: {e}")));
    let _pump_task = spawn_pump_stepper(pump_stepper, shutdown.clone())
        .unwrap_or_else(|e| fatal(&format!("pump step task: {e}")));
    let _reagent_task = spawn_valve(reagent_valve, "reagent", shutdown.clone())
        .unwrap_or_else(|e| fatal(&format!("reagent step task: {e}")));
    let _column_task = spawn_valve(column_valve, "column", shutdown.clone())
        .unwrap_or_else(|e| fatal(&format!("column step task: {e}")));

    if let Some(serial_device) = config.link.serial_device.clone() {
        let mut dispatcher = Dispatcher::new(
            device_handle.clone(),
            executor_handle.clone(),
            program.clone(),
            reagent_names,
            column_names,
        );
        let link_config = config.link.clone();
        let link_shutdown = shutdown.clone();
        std::thread::Builder::new()
            .name("chroma-link".into())
            .spawn(move || loop {
                match open_serial(&link_config) {
                    Ok(mut port) => {
                        if let Err(e) = run_link(&mut port, &mut dispatcher, &link_shutdown) {
                            warn!("link terminated: {e}");
                        }
                    }
                    Err(e) => warn!(device = %serial_device, "cannot open serial link: {e}"),
                }
                if link_shutdown.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_secs(1));
            })
            .unwrap_or_else(|e| fatal(&format!("link task: {e}")));
    } else {
        info!("no serial device configured; command link disabled");
    }

    // ── HTTP front-end (blocks until exit) ──────────────────────────
    let app_state = AppState {
        device: device_handle,
        executor: executor_handle,
        program,
        storage: paths,
    };
    let runtime = tokio::runtime::Runtime::new()
        .unwrap_or_else(|e| fatal(&format!("tokio runtime: {e}")));
    if let Err(e) = runtime.block_on(chroma_server::serve(&config.http.bind_addr, app_state)) {
        error!("HTTP server failed: {e}");
    }

    shutdown.store(true, std::sync::atomic::Ordering::Release);
    let _ = control_task.join();
}

fn fatal(msg: &str) -> ! {
    error!("FATAL: {msg}");
    std::process::exit(1);
}
