use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use setcom_lib::{protocol as proto, ramp, server};
use std::path::PathBuf;
use std::time::Duration;

pub fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM3")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

pub fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address_val =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::Address::try_from(address_val).map_err(|e| e.to_string())
}

pub fn parse_voltage(s: &str) -> Result<proto::Voltage, String> {
    let volts = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid voltage value format: {e}"))?;
    proto::Voltage::try_from(volts).map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run the diagnostic script: read the voltage, write a voltage, read it again.
    /// Every request and response is printed in hex.
    /// Without VOLTAGE the value from the first read is written back.
    #[clap(verbatim_doc_comment)]
    Test {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
        #[arg(verbatim_doc_comment)]
        port: String,

        /// The RS485 device address (1 to 6).
        #[arg(value_parser = parse_address)]
        address: proto::Address,

        /// Voltage to write in the second step (0.0 to 60.0).
        #[arg(value_parser = parse_voltage)]
        voltage: Option<proto::Voltage>,
    },

    /// Ramp the voltage to a target over a given time.
    /// The first and last step are verified; the steps in between only write.
    #[clap(verbatim_doc_comment)]
    Ramp {
        /// Serial port device name.
        port: String,

        /// The RS485 device address (1 to 6).
        #[arg(value_parser = parse_address)]
        address: proto::Address,

        /// Final voltage (0.0 to 60.0).
        #[arg(long, value_parser = parse_voltage)]
        to: proto::Voltage,

        /// Start voltage. Read from the device if omitted.
        #[arg(long, value_parser = parse_voltage)]
        from: Option<proto::Voltage>,

        /// Total ramp time (e.g., "10s", "2m").
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Shape of the ramp: "linear" or "cosine".
        #[arg(long, default_value_t = ramp::Smoothing::Linear)]
        smoothing: ramp::Smoothing,

        /// Minimum time between two ramp steps.
        #[arg(long, default_value = "80ms", value_parser = humantime::parse_duration)]
        step_floor: Duration,
    },

    /// Accept commands over TCP, one per line:
    /// "<PORT> <ADDRESS> <VOLTS>" sets the voltage,
    /// "<PORT> <ADDRESS> <END VOLTS> <DURATION MS>" ramps from the last known voltage.
    /// Replies are "OK:0" or "ERR:<code>:<message>". A new command stops a running ramp.
    #[clap(verbatim_doc_comment)]
    Serve {
        /// Serial port device name.
        port: String,

        /// The RS485 device address (1 to 6).
        #[arg(value_parser = parse_address)]
        address: proto::Address,

        /// Address and TCP port to listen on.
        #[arg(long, default_value = server::DEFAULT_LISTEN_ADDRESS)]
        listen: String,

        /// Shape of ramps: "linear" or "cosine".
        #[arg(long, default_value_t = ramp::Smoothing::Linear)]
        smoothing: ramp::Smoothing,

        /// Minimum time between two ramp steps.
        #[arg(long, default_value = "80ms", value_parser = humantime::parse_duration)]
        step_floor: Duration,
    },
}

const fn about_text() -> &'static str {
    "SetCom - Set the output voltage of an RS485 transformer controller."
}

#[derive(Parser, Debug)]
#[command(
    name = "setcom",
    author,
    version,
    about = about_text(),
    long_about = None,
    propagate_version = true
)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    #[command(subcommand)]
    pub command: Option<CliCommands>,

    /// Serial port device name. Prompted for if missing.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(verbatim_doc_comment)]
    pub port: Option<String>,

    /// The RS485 device address (1 to 6). Prompted for if missing.
    /// Can be specified in decimal or hexadecimal (e.g., "0x01").
    #[arg(value_parser = parse_address, verbatim_doc_comment)]
    pub address: Option<proto::Address>,

    /// Target voltage (0.0 to 60.0). Prompted for if missing.
    #[arg(value_parser = parse_voltage)]
    pub voltage: Option<proto::Voltage>,

    /// Time allowed for each device response.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// Minimum delay between a response and the next command.
    /// USB-to-RS485 converters need time to switch from receiving to transmitting.
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Option<Duration>,

    /// Delay between writing a voltage and reading it back.
    #[arg(global = true, long, value_parser = humantime::parse_duration)]
    pub settle: Option<Duration>,

    /// YAML file with defaults for port, address and timings.
    /// Defaults to "setcom.yml" in the working directory if present.
    #[arg(global = true, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,
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
    fn positional_set() {
        let args = CliArgs::try_parse_from(["setcom", "COM3", "1", "45.5"]).unwrap();
        assert_eq!(args.command, None);
        assert_eq!(args.port.as_deref(), Some("COM3"));
        assert_eq!(args.address.map(|a| *a), Some(1));
        assert_eq!(args.voltage.map(|v| *v), Some(45.5));
    }

    #[test]
    fn no_arguments_prompt_later() {
        let args = CliArgs::try_parse_from(["setcom"]).unwrap();
        assert_eq!(args.port, None);
        assert_eq!(args.address, None);
        assert_eq!(args.voltage, None);
    }

    #[test]
    fn range_checks() {
        assert!(CliArgs::try_parse_from(["setcom", "COM3", "7", "10"]).is_err());
        assert!(CliArgs::try_parse_from(["setcom", "COM3", "1", "60.5"]).is_err());
        assert!(CliArgs::try_parse_from(["setcom", "COM3", "0x02", "10"]).is_ok());
    }

    #[test]
    fn test_subcommand() {
        let args =
            CliArgs::try_parse_from(["setcom", "--timeout", "2s", "test", "/dev/ttyUSB0", "3"])
                .unwrap();
        assert_eq!(args.timeout, Some(Duration::from_secs(2)));
        assert!(matches!(
            args.command,
            Some(CliCommands::Test { ref port, address, voltage: None })
                if port == "/dev/ttyUSB0" && *address == 3
        ));
    }

    #[test]
    fn ramp_subcommand() {
        let args = CliArgs::try_parse_from([
            "setcom",
            "ramp",
            "COM3",
            "1",
            "--to",
            "40",
            "--duration",
            "10s",
            "--smoothing",
            "cosine",
        ])
        .unwrap();
        match args.command {
            Some(CliCommands::Ramp {
                to,
                from,
                duration,
                smoothing,
                step_floor,
                ..
            }) => {
                assert_eq!(*to, 40.0);
                assert_eq!(from, None);
                assert_eq!(duration, Duration::from_secs(10));
                assert_eq!(smoothing, ramp::Smoothing::Cosine);
                assert_eq!(step_floor, ramp::DEFAULT_STEP_FLOOR);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn serve_subcommand() {
        let args = CliArgs::try_parse_from(["setcom", "serve", "COM3", "1"]).unwrap();
        match args.command {
            Some(CliCommands::Serve {
                port,
                listen,
                smoothing,
                ..
            }) => {
                assert_eq!(port, "COM3");
                assert_eq!(listen, server::DEFAULT_LISTEN_ADDRESS);
                assert_eq!(smoothing, ramp::Smoothing::Linear);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let args = CliArgs::try_parse_from([
            "setcom",
            "serve",
            "COM3",
            "1",
            "--listen",
            "127.0.0.1:5000",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Some(CliCommands::Serve { ref listen, .. }) if listen == "127.0.0.1:5000"
        ));
    }
}
