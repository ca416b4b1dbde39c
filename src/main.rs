//! Grating Quality Monitor CLI
//!
//! A command-line interface (CLI) application for polling grating sensor
//! modules over Modbus RTU and monitoring their process capability.
//!
//! This tool allows users to:
//! - Run the acquisition continuously, printing measurements, limit alarms,
//!   capability alarms and periodic per-channel quality reports.
//! - Poll every configured channel once.
//! - Print the encoded "read holding registers" request for a slave.
//! - Print the effective specification limits.
//!
//! Without a reachable serial port the channels produce simulated data.
//!
//! The CLI leverages the `grating_qc_lib` crate for protocol, acquisition and statistics.

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use grating_qc_lib::{
    acquisition::{Acquisition, AcquisitionObserver, LoggingObserver},
    channel::Channel,
    measurement::Measurement,
    protocol as proto,
    quality::QualityEngine,
    settings::{KeyValueSettings, SettingsSnapshot},
};
use log::*;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use std::{fs::File, panic};

mod commandline;

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

/// Prints measurements and alarms to the console in addition to logging them.
struct ConsoleObserver;

impl AcquisitionObserver for ConsoleObserver {
    fn on_measurement(&mut self, channel: Channel, data: &Measurement) {
        LoggingObserver.on_measurement(channel, data);
        println!("Channel {channel}: {data}");
    }

    fn on_alarm(&mut self, message: &str) {
        LoggingObserver.on_alarm(message);
        println!("ALARM: {message}");
    }
}

fn load_settings(config: Option<&Path>) -> Result<KeyValueSettings> {
    let Some(path) = config else {
        debug!("No settings file given, using defaults");
        return Ok(KeyValueSettings::new());
    };
    let file = File::open(path)
        .with_context(|| format!("Cannot open settings file {}", path.display()))?;
    KeyValueSettings::from_yaml_reader(file)
        .with_context(|| format!("Cannot read settings file {}", path.display()))
}

fn print_reports(acquisition: &Acquisition, engine: &Mutex<QualityEngine>) {
    let engine = engine.lock().unwrap_or_else(PoisonError::into_inner);
    for channel in acquisition.channels() {
        let report = engine.generate_report(channel);
        if !report.is_empty() {
            println!("{report}");
        }
    }
}

/// Handles the run command.
///
/// Runs the acquisition with a quality engine attached and prints the reports
/// every `report_interval`, until `duration` elapsed or forever.
fn handle_run(
    snapshot: SettingsSnapshot,
    duration: Option<Duration>,
    report_interval: Duration,
) -> Result<()> {
    let engine = Arc::new(Mutex::new(QualityEngine::new(snapshot.limits.clone())));
    let mut acquisition =
        Acquisition::initialize(snapshot).context("Cannot initialize the acquisition")?;
    acquisition.set_observer(ConsoleObserver)?;
    acquisition.set_quality_engine(Arc::clone(&engine))?;
    if acquisition.is_simulated() {
        println!("Serial port not available, running on simulated data.");
    }
    acquisition
        .start()
        .context("Cannot start the acquisition")?;

    let started = Instant::now();
    loop {
        let wait = match duration {
            Some(duration) => {
                let left = duration.saturating_sub(started.elapsed());
                if left.is_zero() {
                    break;
                }
                left.min(report_interval)
            }
            None => report_interval,
        };
        std::thread::sleep(wait);
        print_reports(&acquisition, &engine);
    }
    acquisition.stop();
    Ok(())
}

fn handle_poll(snapshot: SettingsSnapshot) -> Result<()> {
    let mut acquisition =
        Acquisition::initialize(snapshot).context("Cannot initialize the acquisition")?;
    acquisition.set_observer(ConsoleObserver)?;
    let produced = acquisition.poll_once()?;
    println!(
        "{produced} of {} channel(s) produced data{}",
        acquisition.channels().len(),
        if acquisition.is_simulated() {
            " (simulated)"
        } else {
            ""
        }
    );
    Ok(())
}

fn handle_limits(snapshot: &SettingsSnapshot) {
    println!("Parameter        LSL        USL     Target  Warn Cpk  Alarm Cpk");
    for (parameter, limits) in snapshot.limits.iter() {
        println!(
            "{parameter:<9} {:>10.3} {:>10.3} {:>10.3} {:>9.2} {:>10.2}",
            limits.lower_spec_limit,
            limits.upper_spec_limit,
            limits.target_value,
            limits.warning_cpk,
            limits.alarm_cpk
        );
    }
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "gratingmon started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Commands without settings
    if let commandline::CliCommands::Frame {
        slave,
        address,
        count,
    } = &args.command
    {
        let frame = proto::build_read_holding_registers(**slave, *address, *count);
        println!("{frame}");
        return Ok(());
    }

    // 3. Read the settings once
    let settings = load_settings(args.config.as_deref())?;
    let snapshot = SettingsSnapshot::capture(&settings);

    // 4. Execute the command
    match args.command {
        commandline::CliCommands::Run {
            duration,
            report_interval,
        } => {
            info!("Executing: Run (duration {duration:?}, reports every {report_interval:?})");
            handle_run(snapshot, duration, report_interval)?;
        }
        commandline::CliCommands::Poll => {
            info!("Executing: Poll");
            handle_poll(snapshot)?;
        }
        commandline::CliCommands::Limits => handle_limits(&snapshot),
        commandline::CliCommands::Frame { .. } => unreachable!("Frame is handled earlier."),
    }

    Ok(())
}
