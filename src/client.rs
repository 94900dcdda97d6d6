//! Asynchronous request/response client for the transformer controller.
//!
//! [`DeviceClient`] pairs a [`Transport`] with a [`DeviceProtocol`]: every
//! method sends one request, waits for exactly one response of the expected
//! length and turns it into a typed result. Nothing is retried.
//!
//! ## Example
//!
//! ```no_run
//! use setcom_lib::{client::DeviceClient, config::Config, transport::SerialTransport};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new("/dev/ttyUSB0", 1)?;
//!     let transport = SerialTransport::open(&config)?;
//!     let mut client = DeviceClient::from_config(transport, &config);
//!
//!     println!("Current voltage: {} V", client.read_voltage().await?);
//!     Ok(())
//! }
//! ```

use crate::config::Config;
use crate::device::DeviceProtocol;
use crate::frame::{Frame, HexBytes};
use crate::protocol as proto;
use crate::tokio_common::{Error, Result};
use crate::transport::Transport;
use log::*;
use std::time::Duration;

/// Client for a single controller on an exclusively owned link.
pub struct DeviceClient<T> {
    transport: T,
    device: DeviceProtocol,
    timeout: Duration,
}

impl<T: Transport> DeviceClient<T> {
    pub fn new(transport: T, address: proto::Address, timeout: Duration) -> Self {
        Self {
            transport,
            device: DeviceProtocol::new(address),
            timeout,
        }
    }

    pub fn from_config(transport: T, config: &Config) -> Self {
        Self::new(transport, config.address(), config.timeout())
    }

    pub fn device(&self) -> &DeviceProtocol {
        &self.device
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Sets the time allowed for each response.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends `request` and returns the raw `expected_len` byte response, unchecked.
    pub async fn exchange(&mut self, request: &Frame, expected_len: usize) -> Result<Vec<u8>> {
        debug!("Request to {}: {request}", self.device.address());
        self.transport.send(request).await?;
        let response = self
            .transport
            .receive_exact(expected_len, self.timeout)
            .await?;
        debug!(
            "Response from {}: {}",
            self.device.address(),
            HexBytes(&response)
        );
        Ok(response)
    }

    /// Checks address and checksum, then the error flag.
    pub fn check(&self, response: &[u8]) -> Result<()> {
        self.device.check_response(response)?;
        if DeviceProtocol::is_error_response(response) {
            return Err(Error::DeviceError {
                function: response[1],
            });
        }
        Ok(())
    }

    /// Switches the output on or off.
    pub async fn enable_output(&mut self, enable: bool) -> Result<()> {
        let request = self.device.build_enable_output_command(enable);
        let response = self
            .exchange(&request, proto::ENABLE_OUTPUT_RESPONSE_LEN)
            .await?;
        self.check(&response)
    }

    /// Writes the working voltage. The value is not range checked here.
    pub async fn set_voltage(&mut self, voltage: f64) -> Result<()> {
        let request = self.device.build_set_voltage_command(voltage);
        let response = self
            .exchange(&request, proto::SET_VOLTAGE_RESPONSE_LEN)
            .await?;
        self.check(&response)
    }

    /// Reads the working voltage in volts.
    pub async fn read_voltage(&mut self) -> Result<f64> {
        let request = self.device.build_read_voltage_command();
        let response = self
            .exchange(&request, proto::READ_VOLTAGE_RESPONSE_LEN)
            .await?;
        self.check(&response)?;
        // `check` already guarantees the full length.
        DeviceProtocol::parse_voltage_response(&response).ok_or(Error::InvalidResponse(
            crate::device::ResponseFault::TooShort(response.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ResponseFault;
    use crate::mock_transport::*;
    use assert_matches::assert_matches;

    fn client(replies: impl IntoIterator<Item = Reply>) -> DeviceClient<MockTransport> {
        DeviceClient::new(
            MockTransport::with_replies(replies),
            proto::Address::try_from(1).unwrap(),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn read_voltage() {
        let mut client = client([voltage_reading(1, 44.7)]);
        assert_eq!(client.read_voltage().await.unwrap(), 44.7);
        let crc = crate::codec::compute_checksum(&[0x01, 0x03, 0x15, 0x02]).to_le_bytes();
        assert_eq!(
            client.transport().sent(),
            &[vec![0x01, 0x03, 0x15, 0x02, crc[0], crc[1]]]
        );
    }

    #[tokio::test]
    async fn set_voltage_sends_one_frame() {
        let mut client = client([set_voltage_ack(1, 30.5)]);
        client.set_voltage(30.5).await.unwrap();
        let sent = client.transport().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..6], &[0x01, 0x10, 0x15, 0x02, 0x35, 0x01]);
    }

    #[tokio::test]
    async fn enable_output_ack() {
        let mut client = client([enable_ack(1)]);
        client.enable_output(true).await.unwrap();
        assert_eq!(&client.transport().sent()[0][..5], &[0x01, 0x10, 0x11, 0x01, 0x01]);
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let mut client = client([Reply::Silence]);
        assert_matches!(
            client.read_voltage().await,
            Err(Error::Timeout(t)) if t == Duration::from_millis(10)
        );
    }

    #[tokio::test]
    async fn short_reply_times_out() {
        let mut client = client([Reply::Bytes(vec![0x01, 0x10, 0x15])]);
        assert_matches!(client.set_voltage(1.0).await, Err(Error::Timeout(_)));
    }

    #[tokio::test]
    async fn foreign_address_is_rejected() {
        let mut client = client([voltage_reading(2, 10.0)]);
        assert_matches!(
            client.read_voltage().await,
            Err(Error::InvalidResponse(ResponseFault::AddressMismatch {
                expected: 1,
                actual: 2
            }))
        );
    }

    #[tokio::test]
    async fn error_flag_is_a_device_error() {
        let reply = Reply::Bytes(framed(&[0x01, 0x90, 0x15, 0x02, 0x00, 0x00]));
        let mut client = client([reply]);
        assert_matches!(
            client.set_voltage(1.0).await,
            Err(Error::DeviceError { function: 0x90 })
        );
    }

    #[tokio::test]
    async fn send_failure_is_io() {
        let mut client = client([enable_ack(1)]);
        let mut transport = MockTransport::new();
        transport.set_send_error(true);
        client.transport = transport;
        assert_matches!(client.enable_output(true).await, Err(Error::Io(_)));
    }
}
