//! Register map, function codes and value types of the transformer controller.
//!
//! The controller speaks a fixed Modbus-RTU-like dialect: register addresses
//! and counts are single bytes and every register holds one byte. Values
//! that do not fit into one register are spread over consecutive registers
//! in little-endian order.

use std::fmt;
use std::ops::Deref;

/// Errors raised when a value does not fit the device's accepted ranges.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The device address is outside `ADDRESS_MIN..=ADDRESS_MAX`.
    #[error("Address {0} is out of range ({min}..={max})", min = ADDRESS_MIN, max = ADDRESS_MAX)]
    AddressOutOfRange(u8),
    /// The requested voltage is outside `VOLTAGE_MIN..=VOLTAGE_MAX`.
    #[error(
        "Voltage {0} V is out of range ({min}..={max} V)",
        min = VOLTAGE_MIN,
        max = VOLTAGE_MAX
    )]
    VoltageOutOfRange(f64),
}

/// The only baud rate the controller supports.
pub const BAUD_RATE: u32 = 9600;

/// Function code for writing consecutive registers.
pub const FUNCTION_WRITE_REGISTERS: u8 = 0x10;
/// Function code for reading consecutive registers.
pub const FUNCTION_READ_REGISTERS: u8 = 0x03;
/// Bit set in the function code of a response when the device rejected a request.
pub const FUNCTION_ERROR_FLAG: u8 = 0x80;

/// Output-enable register, non-zero means enabled.
pub const OUTPUT_ENABLE_REG_ADDR: u8 = 0x11;
pub const OUTPUT_ENABLE_REG_QUAN: u8 = 1;

/// Working voltage registers, low byte at 0x15 and high byte at 0x16.
pub const VOLTAGE_REG_ADDR: u8 = 0x15;
pub const VOLTAGE_REG_QUAN: u8 = 2;

/// Expected response length after writing the output-enable register.
pub const ENABLE_OUTPUT_RESPONSE_LEN: usize = 7;
/// Expected response length after writing the voltage registers.
pub const SET_VOLTAGE_RESPONSE_LEN: usize = 8;
/// Expected response length after reading the voltage registers.
pub const READ_VOLTAGE_RESPONSE_LEN: usize = 8;
/// Offset of the low voltage byte inside a read response.
pub const READ_VOLTAGE_PAYLOAD_OFFSET: usize = 4;

pub const ADDRESS_MIN: u8 = 1;
pub const ADDRESS_MAX: u8 = 6;

pub const VOLTAGE_MIN: f64 = 0.0;
pub const VOLTAGE_MAX: f64 = 60.0;
/// Maximum deviation between requested and read-back voltage before a mismatch is reported.
pub const VOLTAGE_TOLERANCE: f64 = 0.5;
/// Register units per volt.
pub const VOLTAGE_SCALE: f64 = 10.0;

/// Encodes a voltage into its register value: volts times ten, truncated toward zero.
///
/// Out of range values are not rejected. Negative and NaN inputs encode to `0`,
/// values above `u16::MAX / 10` saturate.
pub fn encode_voltage(volts: f64) -> u16 {
    (volts * VOLTAGE_SCALE) as u16
}

/// Decodes a register value into volts.
pub fn decode_voltage(value: u16) -> f64 {
    value as f64 / VOLTAGE_SCALE
}

/// A validated RS485 device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(u8);

impl Address {
    pub const MIN: Address = Address(ADDRESS_MIN);
    pub const MAX: Address = Address(ADDRESS_MAX);
}

impl Default for Address {
    fn default() -> Self {
        Self::MIN
    }
}

impl Deref for Address {
    type Target = u8;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (ADDRESS_MIN..=ADDRESS_MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::AddressOutOfRange(value))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// A voltage inside the range the controller accepts.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Voltage(f64);

impl Voltage {
    pub const ZERO: Voltage = Voltage(VOLTAGE_MIN);

    /// The register value written to the device for this voltage.
    pub fn encode(&self) -> u16 {
        encode_voltage(self.0)
    }
}

impl Deref for Voltage {
    type Target = f64;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for Voltage {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        // NaN fails the range check as well.
        if (VOLTAGE_MIN..=VOLTAGE_MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::VoltageOutOfRange(value))
        }
    }
}

impl fmt::Display for Voltage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} V", self.0)
    }
}
