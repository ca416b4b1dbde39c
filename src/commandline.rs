use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use grating_qc_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;

fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::Address::try_from(address_val).map_err(|e| e.to_string())
}

fn parse_register(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid register address format: {e}"))
}

fn parse_register_count(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex_range(s, 1, proto::MAX_READ_QUANTITY)
        .map_err(|e| format!("Invalid register count: {e}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the acquisition: poll all channels continuously, print measurements
    /// and alarms, and print a quality report per channel at every report interval.
    #[clap(verbatim_doc_comment)]
    Run {
        /// Stop after this time (e.g., "30s", "5m"). Runs until interrupted when omitted.
        #[arg(value_parser = humantime::parse_duration, short, long, verbatim_doc_comment)]
        duration: Option<Duration>,

        /// Interval between quality reports (e.g., "10s", "1m").
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "10s", verbatim_doc_comment)]
        report_interval: Duration,
    },

    /// Poll every configured channel once and print the measurements.
    Poll,

    /// Print the Modbus RTU "read holding registers" request frame as hex.
    Frame {
        /// The Modbus RTU slave address (1 to 247).
        /// Can be specified in decimal or hexadecimal (e.g., "0x0B").
        #[arg(short, long, value_parser = parse_address, verbatim_doc_comment)]
        slave: proto::Address,

        /// First register address.
        #[arg(short, long, default_value_t = 20, value_parser = parse_register)]
        address: u16,

        /// Number of registers to read (1 to 125).
        #[arg(short, long, default_value_t = 2, value_parser = parse_register_count)]
        count: u16,
    },

    /// Print the effective specification limits of every parameter.
    Limits,
}

const fn about_text() -> &'static str {
    "Grating quality monitor - Poll grating sensors via Modbus RTU and track their Cp/Cpk."
}

#[derive(Parser, Debug)]
#[command(name="gratingmon", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// YAML settings file with sections such as "COM", "RoundDisplay",
    /// "Channel_1LeftGrating" or "Limits.P1". Built-in defaults apply when omitted.
    #[arg(global = true, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn frame_arguments() {
        let args = CliArgs::parse_from(["gratingmon", "frame", "--slave", "0x0A", "--count", "3"]);
        assert_eq!(
            args.command,
            CliCommands::Frame {
                slave: proto::Address::try_from(10).unwrap(),
                address: 20,
                count: 3,
            }
        );
        assert!(CliArgs::try_parse_from(["gratingmon", "frame", "--slave", "0"]).is_err());
        assert!(
            CliArgs::try_parse_from(["gratingmon", "frame", "--slave", "1", "--count", "126"])
                .is_err()
        );
    }

    #[test]
    fn run_arguments() {
        let args = CliArgs::parse_from([
            "gratingmon",
            "run",
            "--duration",
            "1m",
            "--config",
            "plant.yaml",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("plant.yaml")));
        assert_eq!(
            args.command,
            CliCommands::Run {
                duration: Some(Duration::from_secs(60)),
                report_interval: Duration::from_secs(10),
            }
        );
    }
}
