//! A library for controlling the output voltage of an RS485 transformer controller.
//!
//! The controller speaks a fixed Modbus-RTU-like dialect (one-byte registers,
//! Modbus CRC-16). This crate provides it in layers:
//!
//! 1.  **Protocol and Codec**: Pure, synchronous building blocks. [`codec`]
//!     computes and checks the CRC, [`frame`] lays out requests, and
//!     [`device::DeviceProtocol`] builds the controller's commands and checks
//!     its responses.
//! 2.  **Transport and Client**: [`transport::SerialTransport`] owns the serial
//!     port; [`client::DeviceClient`] performs one request/response exchange
//!     per call.
//! 3.  **Sequencer**: [`sequencer::VoltageControlSequencer`] enables the output,
//!     writes the voltage and reads it back, tolerating failures of the first
//!     and last step.
//!
//! ## Features
//!
//! - **Typed Frames**: Requests are built from structs with named fields, not offsets.
//! - **Tagged Errors**: Every failure is classified (`Timeout`, `InvalidResponse`,
//!   `DeviceError`, ...).
//! - **Diagnostics and Ramps**: A read/write/read test script and eased voltage ramps.
//! - **Command Server**: Line based TCP commands for sets and pre-emptible ramps
//!   (`server` feature).
//!
//! ## Quick Start
//!
//! ```no_run
//! use setcom_lib::{
//!     config::Config, sequencer::VoltageControlSequencer, transport::SerialTransport,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new("/dev/ttyUSB0", 1)?;
//!     let transport = SerialTransport::open(&config)?;
//!     let mut sequencer = VoltageControlSequencer::new(transport, config);
//!
//!     let report = sequencer.run(45.0).await?;
//!     println!("Voltage set, device reports {:?} V", report.actual());
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod device;
pub mod diagnostic;
pub mod frame;
pub mod protocol;
pub mod ramp;
pub mod sequencer;
#[cfg(feature = "server")]
pub mod server;
pub mod tokio_common;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock_transport;
