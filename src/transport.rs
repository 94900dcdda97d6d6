//! Byte transport to the controller.
//!
//! [`Transport`] is the seam between protocol logic and the wire; the
//! production implementation is [`SerialTransport`] on top of
//! `tokio_serial::SerialStream`.

use crate::config::Config;
use crate::frame::HexBytes;
use crate::tokio_common::{serial_port_builder, Error, Result};
use log::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialStream};

/// A half-duplex byte link carrying one request/response exchange at a time.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Writes the whole buffer or fails.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Waits for exactly `expected_len` bytes.
    ///
    /// Fails with [`Error::Timeout`] if they do not arrive within `timeout`.
    /// Bytes received before the timeout are dropped.
    async fn receive_exact(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>>;
}

/// Exclusive owner of an open serial port. The port is closed when this value is dropped.
pub struct SerialTransport {
    port: String,
    stream: SerialStream,
}

impl SerialTransport {
    /// Opens the configured port with the controller's fixed line settings.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`Error::PortUnavailable`] if the port does not exist, is in use or
    /// cannot be accessed.
    pub fn open(config: &Config) -> Result<Self> {
        let port = config.port().to_owned();
        let stream = SerialStream::open(&serial_port_builder(&port)).map_err(|source| {
            Error::PortUnavailable {
                port: port.clone(),
                source,
            }
        })?;
        info!("Opened serial port {port}");
        Ok(Self { port, stream })
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Closes the port now instead of at the end of the scope.
    pub fn close(self) {
        drop(self);
    }
}

impl Transport for SerialTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        // A late answer to an earlier, timed out request must not be taken
        // for the answer to this one.
        self.stream
            .clear(ClearBuffer::Input)
            .map_err(std::io::Error::from)?;
        trace!("{} <- {}", self.port, HexBytes(bytes));
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive_exact(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; expected_len];
        match tokio::time::timeout(timeout, self.stream.read_exact(&mut buffer)).await {
            Ok(Ok(_)) => {
                trace!("{} -> {}", self.port, HexBytes(&buffer));
                Ok(buffer)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_) => {
                debug!(
                    "{}: no {expected_len} byte response within {timeout:?}",
                    self.port
                );
                Err(Error::Timeout(timeout))
            }
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        info!("Closing serial port {}", self.port);
    }
}
