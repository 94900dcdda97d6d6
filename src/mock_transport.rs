//! We use this mocking module in unit tests to emulate the serial link.

use crate::codec;
use crate::sequencer::CancelFlag;
use crate::tokio_common::{Error, Result};
use crate::transport::Transport;
use std::collections::VecDeque;
use std::time::Duration;

/// What the emulated device does when a response is awaited.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with these bytes.
    Bytes(Vec<u8>),
    /// Stay silent until the read times out.
    Silence,
    /// Play the inner reply, then raise the flag as if the user pressed Ctrl-C.
    ThenCancel(Box<Reply>, CancelFlag),
}

/// Scripted transport: records every written frame and plays back one
/// queued [`Reply`] per `receive_exact` call.
#[derive(Debug, Default)]
pub struct MockTransport {
    sent: Vec<Vec<u8>>,
    replies: VecDeque<Reply>,
    fail_on_send: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Frames written so far, oldest first.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Configure whether writes fail with an I/O error.
    pub fn set_send_error(&mut self, fail: bool) {
        self.fail_on_send = fail;
    }
}

impl Transport for MockTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.fail_on_send {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        self.sent.push(bytes.to_vec());
        Ok(())
    }

    async fn receive_exact(&mut self, expected_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut reply = self.replies.pop_front();
        while let Some(Reply::ThenCancel(inner, cancel)) = reply {
            cancel.cancel();
            reply = Some(*inner);
        }
        match reply {
            // A short answer never completes the read, like a real port.
            Some(Reply::Bytes(bytes)) if bytes.len() >= expected_len => {
                Ok(bytes[..expected_len].to_vec())
            }
            Some(_) | None => Err(Error::Timeout(timeout)),
        }
    }
}

/// Appends the checksum to `body`.
pub fn framed(body: &[u8]) -> Vec<u8> {
    let mut bytes = body.to_vec();
    bytes.extend_from_slice(&codec::compute_checksum(body).to_le_bytes());
    bytes
}

/// Acknowledgement of an output-enable write.
pub fn enable_ack(address: u8) -> Reply {
    Reply::Bytes(framed(&[address, 0x10, 0x11, 0x01, 0x01]))
}

/// Acknowledgement of a voltage write.
pub fn set_voltage_ack(address: u8, volts: f64) -> Reply {
    let [lo, hi] = crate::protocol::encode_voltage(volts).to_le_bytes();
    Reply::Bytes(framed(&[address, 0x10, 0x15, 0x02, lo, hi]))
}

/// Answer to a voltage read.
pub fn voltage_reading(address: u8, volts: f64) -> Reply {
    let [lo, hi] = crate::protocol::encode_voltage(volts).to_le_bytes();
    Reply::Bytes(framed(&[address, 0x03, 0x15, 0x02, lo, hi]))
}
