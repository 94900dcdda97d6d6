//! Session configuration.
//!
//! A [`Config`] is validated when it is built and read-only afterwards. With
//! the `serde` feature a YAML [`ConfigFile`] can supply defaults for it.

use crate::protocol as proto;
use log::*;
use std::time::Duration;

/// Settings for one voltage control session.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    port: String,
    address: proto::Address,
    timeout: Duration,
    delay: Duration,
    settle_delay: Duration,
}

impl Config {
    /// Time allowed for a response to arrive.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
    /// Pause between a response and the next request.
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(50);
    /// Pause between writing a voltage and reading it back.
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

    /// Creates a configuration with default timings.
    ///
    /// # Errors
    ///
    /// [`proto::Error::AddressOutOfRange`] if `address` is not a valid device address.
    pub fn new(port: impl Into<String>, address: u8) -> Result<Self, proto::Error> {
        Ok(Self {
            port: port.into(),
            address: proto::Address::try_from(address)?,
            timeout: Self::DEFAULT_TIMEOUT,
            delay: Self::DEFAULT_DELAY,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the pause between exchanges, raised to the RTU minimum if needed.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = check_inter_frame_delay(delay);
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn address(&self) -> proto::Address {
        self.address
    }

    pub fn baud_rate(&self) -> u32 {
        proto::BAUD_RATE
    }

    pub fn max_voltage(&self) -> f64 {
        proto::VOLTAGE_MAX
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }
}

/// Minimum silence between two frames: 3.5 character times of 11 bits each.
pub fn minimum_inter_frame_delay() -> Duration {
    let bits_per_char = 11.0;
    let char_time_secs = bits_per_char / proto::BAUD_RATE as f64;
    let delay_micros = (3.5 * char_time_secs * 1_000_000.0) as u64;
    const PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;
    Duration::from_micros(delay_micros.max(PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS))
}

/// Returns `delay`, or the minimum inter-frame delay if `delay` is shorter.
pub fn check_inter_frame_delay(delay: Duration) -> Duration {
    let minimum = minimum_inter_frame_delay();
    if delay < minimum {
        warn!(
            "Delay of {delay:?} is below the minimum of {minimum:?} at {} baud. Using minimum.",
            proto::BAUD_RATE
        );
        minimum
    } else {
        delay
    }
}

#[cfg(feature = "serde")]
pub use file::{ConfigFile, ConfigFileError};

#[cfg(feature = "serde")]
mod file {
    use serde::Deserialize;
    use std::fs::File;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigFileError {
        #[error("Cannot open config file: {0}")]
        Io(#[from] std::io::Error),
        #[error("Cannot parse config file: {0}")]
        Parse(#[from] serde_yaml::Error),
    }

    /// Optional defaults read from a YAML file.
    ///
    /// ```yaml
    /// port: /dev/ttyUSB0
    /// address: 1
    /// timeout: 1s
    /// delay: 50ms
    /// settle_delay: 500ms
    /// ```
    #[derive(Debug, Clone, Default, PartialEq, Deserialize)]
    #[serde(default, deny_unknown_fields)]
    pub struct ConfigFile {
        pub port: Option<String>,
        pub address: Option<u8>,
        #[serde(with = "humantime_serde")]
        pub timeout: Option<Duration>,
        #[serde(with = "humantime_serde")]
        pub delay: Option<Duration>,
        #[serde(with = "humantime_serde")]
        pub settle_delay: Option<Duration>,
    }

    impl ConfigFile {
        pub fn load(path: &Path) -> Result<Self, ConfigFileError> {
            log::debug!("Loading config file from {path:?}");
            let file = File::open(path)?;
            Ok(serde_yaml::from_reader(file)?)
        }

        pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigFileError> {
            Ok(serde_yaml::from_str(yaml)?)
        }
    }
}
