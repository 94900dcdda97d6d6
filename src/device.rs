//! Frame building and response checking bound to one device address.

use crate::codec;
use crate::frame::{Frame, ReadRegisters, WriteRegisters};
use crate::protocol as proto;

/// Why a response was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResponseFault {
    #[error("response too short ({0} bytes)")]
    TooShort(usize),
    #[error("response from address {actual:#04x}, expected {expected:#04x}")]
    AddressMismatch { expected: u8, actual: u8 },
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// Minimum length of anything that can be a response: address, function code, one byte.
const MIN_RESPONSE_LEN: usize = 3;

/// Builds requests for, and checks responses from, a single controller.
#[derive(Debug, Clone, Copy)]
pub struct DeviceProtocol {
    address: proto::Address,
}

impl DeviceProtocol {
    pub fn new(address: proto::Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> proto::Address {
        self.address
    }

    /// Builds the 8-byte frame writing `voltage` into the working voltage registers.
    ///
    /// The value is encoded as is; range checks belong to the caller.
    pub fn build_set_voltage_command(&self, voltage: f64) -> Frame {
        let payload = proto::encode_voltage(voltage).to_le_bytes();
        WriteRegisters {
            address: self.address,
            start: proto::VOLTAGE_REG_ADDR,
            payload: &payload,
        }
        .encode()
    }

    /// Builds the 7-byte frame switching the output on or off.
    pub fn build_enable_output_command(&self, enable: bool) -> Frame {
        WriteRegisters {
            address: self.address,
            start: proto::OUTPUT_ENABLE_REG_ADDR,
            payload: &[enable as u8],
        }
        .encode()
    }

    /// Builds the 6-byte frame reading the working voltage registers.
    pub fn build_read_voltage_command(&self) -> Frame {
        ReadRegisters {
            address: self.address,
            start: proto::VOLTAGE_REG_ADDR,
            count: proto::VOLTAGE_REG_QUAN,
        }
        .encode()
    }

    /// Checks length, sender address and checksum of a response, in that order.
    pub fn check_response(&self, response: &[u8]) -> Result<(), ResponseFault> {
        if response.len() < MIN_RESPONSE_LEN {
            return Err(ResponseFault::TooShort(response.len()));
        }
        if response[0] != *self.address {
            return Err(ResponseFault::AddressMismatch {
                expected: *self.address,
                actual: response[0],
            });
        }
        if !codec::validate(response) {
            return Err(ResponseFault::ChecksumMismatch);
        }
        Ok(())
    }

    pub fn validate_response(&self, response: &[u8]) -> bool {
        self.check_response(response).is_ok()
    }

    /// Returns `true` if the response is too short to judge or carries the error flag.
    pub fn is_error_response(response: &[u8]) -> bool {
        match response.get(1) {
            Some(function) if response.len() >= MIN_RESPONSE_LEN => {
                function & proto::FUNCTION_ERROR_FLAG != 0
            }
            _ => true,
        }
    }

    /// Decodes the voltage carried by a read response.
    ///
    /// Only decodes; run [`check_response`](Self::check_response) first.
    /// Returns `None` if the response is shorter than a read response.
    pub fn parse_voltage_response(response: &[u8]) -> Option<f64> {
        if response.len() < proto::READ_VOLTAGE_RESPONSE_LEN {
            return None;
        }
        let offset = proto::READ_VOLTAGE_PAYLOAD_OFFSET;
        let raw = u16::from_le_bytes([response[offset], response[offset + 1]]);
        Some(proto::decode_voltage(raw))
    }
}
