//! This module provides the error taxonomy and serial line settings shared by
//! the `tokio` based transport, client and sequencer.
//!
//! Every [`Error`] variant belongs to exactly one [`ErrorKind`], so callers can
//! decide per step whether a failure is tolerated or aborts the operation.
use crate::device::ResponseFault;
use crate::protocol as proto;
use std::time::Duration;

/// Represents all possible errors of a voltage control session.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The serial port could not be claimed.
    #[error("Serial port '{port}' unavailable: {source}")]
    PortUnavailable {
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// No complete response arrived in time.
    #[error("No response within {0:?}")]
    Timeout(Duration),

    /// The response failed length, address or checksum checks.
    #[error("Invalid response: {0}")]
    InvalidResponse(#[from] ResponseFault),

    /// The device answered with the error flag set in the function code.
    #[error("Device rejected the request (function code {function:#04x})")]
    DeviceError { function: u8 },

    /// A value is outside the accepted range.
    #[error(transparent)]
    OutOfRange(#[from] proto::Error),

    /// Reading from or writing to the open port failed.
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was interrupted between two steps.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Classification of [`Error`] used to branch on failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PortUnavailable,
    Timeout,
    InvalidResponse,
    DeviceError,
    OutOfRange,
    Io,
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PortUnavailable { .. } => ErrorKind::PortUnavailable,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Error::DeviceError { .. } => ErrorKind::DeviceError,
            Error::OutOfRange(_) => ErrorKind::OutOfRange,
            Error::Io(_) => ErrorKind::Io,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// The result type for tokio operations.
pub type Result<T> = std::result::Result<T, crate::tokio_common::Error>;

/// The parity used for serial communication.
pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
/// The number of stop bits used for serial communication.
pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
/// The number of data bits used for serial communication.
pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

/// Creates a `tokio_serial::SerialPortBuilder` with the fixed line settings
/// of the controller (9600 baud, 8N1, no flow control).
///
/// # Arguments
///
/// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0` or `COM3`).
pub fn serial_port_builder(device: &str) -> tokio_serial::SerialPortBuilder {
    tokio_serial::new(device, proto::BAUD_RATE)
        .parity(*PARITY)
        .stop_bits(*STOP_BITS)
        .data_bits(*DATA_BITS)
        .flow_control(tokio_serial::FlowControl::None)
}
