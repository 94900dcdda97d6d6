//! SetCom CLI
//!
//! A command-line interface (CLI) application for setting the output voltage
//! of an RS485 transformer controller.
//!
//! This tool allows users to:
//! - Set the output voltage (enable output, write voltage, verify), with the
//!   port, address and voltage given as arguments or entered interactively.
//! - Run a diagnostic read/write/read script that prints every frame.
//! - Ramp the voltage to a target along a linear or cosine curve.
//! - Serve set and ramp commands to automation clients over TCP.
//!
//! The CLI leverages the `setcom_lib` crate for protocol definitions and client operations.

use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::Input;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use setcom_lib::{
    client::DeviceClient,
    config::{Config, ConfigFile},
    diagnostic, protocol as proto, ramp, server,
    sequencer::{CancelFlag, EnableOutcome, VoltageControlSequencer, Verification},
    transport::SerialTransport,
};
use std::panic;
use std::path::Path;
use std::time::Duration;

mod commandline;

const DEFAULT_CONFIG_FILE: &str = "setcom.yml";

const CANCEL_POLL: Duration = Duration::from_millis(100);

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

/// Loads the given config file, or the default one if it exists.
fn load_config_file(path: Option<&Path>) -> Result<ConfigFile> {
    match path {
        Some(path) => ConfigFile::load(path)
            .with_context(|| format!("Cannot load config file {}", path.display())),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            ConfigFile::load(Path::new(DEFAULT_CONFIG_FILE))
                .with_context(|| format!("Cannot load config file {DEFAULT_CONFIG_FILE}"))
        }
        None => Ok(ConfigFile::default()),
    }
}

/// Command-line values win over config file values, which win over defaults.
fn build_config(
    args: &commandline::CliArgs,
    file: &ConfigFile,
    port: String,
    address: proto::Address,
) -> Result<Config> {
    let config = Config::new(port, *address)?
        .with_timeout(
            args.timeout
                .or(file.timeout)
                .unwrap_or(Config::DEFAULT_TIMEOUT),
        )
        .with_delay(args.delay.or(file.delay).unwrap_or(Config::DEFAULT_DELAY))
        .with_settle_delay(
            args.settle
                .or(file.settle_delay)
                .unwrap_or(Config::DEFAULT_SETTLE_DELAY),
        );
    debug!("Config: {config:?}");
    Ok(config)
}

fn prompt_port(default: Option<String>) -> Result<String> {
    Input::<String>::new()
        .with_prompt("Serial port")
        .default(default.unwrap_or_else(commandline::default_device_name))
        .interact_text()
        .context("Failed to read serial port")
}

fn prompt_address(default: Option<u8>) -> Result<proto::Address> {
    let value = Input::<u8>::new()
        .with_prompt(format!(
            "Device address ({}-{})",
            proto::ADDRESS_MIN,
            proto::ADDRESS_MAX
        ))
        .default(default.unwrap_or(*proto::Address::default()))
        .validate_with(|value: &u8| {
            proto::Address::try_from(*value)
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .interact_text()
        .context("Failed to read device address")?;
    Ok(proto::Address::try_from(value)?)
}

fn prompt_voltage() -> Result<proto::Voltage> {
    let value = Input::<f64>::new()
        .with_prompt(format!(
            "Voltage ({}-{} V)",
            proto::VOLTAGE_MIN,
            proto::VOLTAGE_MAX
        ))
        .validate_with(|value: &f64| {
            proto::Voltage::try_from(*value)
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .interact_text()
        .context("Failed to read voltage")?;
    Ok(proto::Voltage::try_from(value)?)
}

/// Sets `cancel` on Ctrl-C. A running exchange still completes or times out.
fn install_cancel_handler() -> Result<CancelFlag> {
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        handler_flag.cancel();
        trace!("Received Ctrl-C");
    })
    .context("Error setting Ctrl-C handler")?;
    Ok(cancel)
}

fn open_transport(config: &Config) -> Result<SerialTransport> {
    info!(
        "Opening {} at {} baud for device {}",
        config.port(),
        config.baud_rate(),
        config.address()
    );
    SerialTransport::open(config)
        .with_context(|| format!("Cannot open serial port {}", config.port()))
}

fn open_sequencer(
    config: Config,
    cancel: CancelFlag,
) -> Result<VoltageControlSequencer<SerialTransport>> {
    let transport = open_transport(&config)?;
    Ok(VoltageControlSequencer::new(transport, config).with_cancel_flag(cancel))
}

async fn handle_set(config: Config, voltage: proto::Voltage, cancel: CancelFlag) -> Result<()> {
    let mut sequencer = open_sequencer(config, cancel)?;
    info!("Executing: Set Voltage to {voltage}");
    let report = sequencer
        .run(*voltage)
        .await
        .with_context(|| format!("Failed to set voltage to {voltage}"))?;

    if let EnableOutcome::Unconfirmed(err) = &report.enable {
        println!("Note: output enable was not confirmed ({err}).");
    }
    match &report.verification {
        Verification::Matched { actual } => {
            println!("Voltage set to {voltage}, device reports {actual:.1} V.");
        }
        Verification::Mismatch { actual, delta } => {
            println!(
                "Voltage set to {voltage}. \
                 WARNING: device reports {actual:.1} V ({delta:.1} V off)."
            );
        }
        Verification::Unverified(err) => {
            println!("Voltage set to {voltage}, could not verify: {err}.");
        }
    }
    Ok(())
}

async fn handle_test(config: Config, voltage: Option<proto::Voltage>) -> Result<()> {
    let transport = open_transport(&config)?;
    let mut client = DeviceClient::from_config(transport, &config);
    println!(
        "Diagnostic on {} for device {}",
        config.port(),
        config.address()
    );
    let report = diagnostic::run_diagnostic(&mut client, voltage, config.delay()).await;
    print!("{report}");
    if !report.passed() {
        bail!("Diagnostic failed");
    }
    println!("Diagnostic passed.");
    Ok(())
}

async fn handle_ramp(
    config: Config,
    from: Option<proto::Voltage>,
    to: proto::Voltage,
    duration: Duration,
    smoothing: ramp::Smoothing,
    step_floor: Duration,
    cancel: CancelFlag,
) -> Result<()> {
    let mut sequencer = open_sequencer(config, cancel)?;
    let start = match from {
        Some(start) => start,
        None => ramp::current_voltage(&mut sequencer).await,
    };
    let plan = ramp::RampPlan::plan(start, to, duration, smoothing, step_floor);
    println!(
        "Ramping {start} -> {to} in {} steps ({smoothing}, {:?} apart)",
        plan.steps.len(),
        plan.interval
    );
    let summary = ramp::run_ramp(&mut sequencer, &plan).await;
    if summary.cancelled {
        match summary.last_applied {
            Some(volts) => bail!(
                "Ramp cancelled after {} applied steps, output left at {volts:.1} V",
                summary.applied
            ),
            None => bail!("Ramp cancelled before any step was applied"),
        }
    }
    if summary.applied == 0 {
        bail!("Ramp failed: no step could be applied");
    }
    println!(
        "Ramp finished: {} steps applied, {} failed.",
        summary.applied, summary.failed
    );
    Ok(())
}

/// Serves TCP clients until Ctrl-C.
async fn handle_serve(
    config: Config,
    listen: &str,
    smoothing: ramp::Smoothing,
    step_floor: Duration,
    cancel: CancelFlag,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Cannot listen on {listen}"))?;
    let transport = open_transport(&config)?;
    let controller = server::Controller::new(VoltageControlSequencer::new(transport, config))
        .with_smoothing(smoothing)
        .with_step_floor(step_floor);
    println!("Serving commands on {}", listener.local_addr()?);
    tokio::select! {
        result = server::serve(listener, controller) => result.context("Server failed")?,
        () = cancel.cancelled(CANCEL_POLL) => info!("Shutting down server"),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "SetCom CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Defaults from the config file
    let file = load_config_file(args.config.as_deref())?;
    let cancel = install_cancel_handler()?;

    // 3. Execute the command
    match &args.command {
        Some(commandline::CliCommands::Test {
            port,
            address,
            voltage,
        }) => {
            let config = build_config(&args, &file, port.clone(), *address)?;
            handle_test(config, *voltage).await
        }
        Some(commandline::CliCommands::Ramp {
            port,
            address,
            to,
            from,
            duration,
            smoothing,
            step_floor,
        }) => {
            let config = build_config(&args, &file, port.clone(), *address)?;
            handle_ramp(config, *from, *to, *duration, *smoothing, *step_floor, cancel).await
        }
        Some(commandline::CliCommands::Serve {
            port,
            address,
            listen,
            smoothing,
            step_floor,
        }) => {
            let config = build_config(&args, &file, port.clone(), *address)?;
            handle_serve(config, listen, *smoothing, *step_floor, cancel).await
        }
        None => {
            let port = match &args.port {
                Some(port) => port.clone(),
                None => prompt_port(file.port.clone())?,
            };
            let address = match args.address {
                Some(address) => address,
                None => prompt_address(file.address)?,
            };
            let voltage = match args.voltage {
                Some(voltage) => voltage,
                None => prompt_voltage()?,
            };
            let config = build_config(&args, &file, port, address)?;
            handle_set(config, voltage, cancel).await
        }
    }
}
