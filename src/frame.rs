//! Typed request frames.
//!
//! Each frame kind is a struct with named fields; `encode` lays the fields
//! out and appends the checksum so no caller does offset arithmetic.

use crate::codec;
use crate::protocol as proto;
use std::fmt;
use std::ops::Deref;

/// Longest request frame the controller accepts.
pub const MAX_FRAME_LEN: usize = 8;

/// Header of every request: address, function code, register start, register count.
const HEADER_LEN: usize = 4;

/// Largest register payload that still fits into a frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN - codec::CHECKSUM_LEN;

/// An encoded request, ready to be transmitted.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bytes: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Deref for Frame {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({})", self)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", HexBytes(self.as_bytes()))
    }
}

/// Formats a byte slice as space separated upper case hex pairs.
pub struct HexBytes<'a>(pub &'a [u8]);

impl fmt::Display for HexBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

/// Function `0x10`: write consecutive one-byte registers.
///
/// Layout: `address, 0x10, start, count, payload.., crc_lo, crc_hi` with
/// `count == payload.len()`.
#[derive(Debug, Clone, Copy)]
pub struct WriteRegisters<'a> {
    pub address: proto::Address,
    pub start: u8,
    pub payload: &'a [u8],
}

impl WriteRegisters<'_> {
    /// # Panics
    ///
    /// Panics if the payload is longer than [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Frame {
        assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "register payload of {} bytes does not fit a frame",
            self.payload.len()
        );
        let mut bytes = [0u8; MAX_FRAME_LEN];
        bytes[0] = *self.address;
        bytes[1] = proto::FUNCTION_WRITE_REGISTERS;
        bytes[2] = self.start;
        bytes[3] = self.payload.len() as u8;
        let coverage = HEADER_LEN + self.payload.len();
        bytes[HEADER_LEN..coverage].copy_from_slice(self.payload);
        codec::append_checksum(&mut bytes, coverage);
        Frame {
            bytes,
            len: coverage + codec::CHECKSUM_LEN,
        }
    }
}

/// Function `0x03`: read consecutive one-byte registers.
///
/// Layout on the wire: `address, 0x03, start, count, crc_lo, crc_hi`. The
/// controller expects the checksum right after the register count; the two
/// zero bytes a standard read would carry are never transmitted and not
/// covered by the checksum.
#[derive(Debug, Clone, Copy)]
pub struct ReadRegisters {
    pub address: proto::Address,
    pub start: u8,
    pub count: u8,
}

impl ReadRegisters {
    pub fn encode(&self) -> Frame {
        let mut bytes = [0u8; MAX_FRAME_LEN];
        bytes[0] = *self.address;
        bytes[1] = proto::FUNCTION_READ_REGISTERS;
        bytes[2] = self.start;
        bytes[3] = self.count;
        codec::append_checksum(&mut bytes, HEADER_LEN);
        Frame {
            bytes,
            len: HEADER_LEN + codec::CHECKSUM_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(value: u8) -> proto::Address {
        proto::Address::try_from(value).unwrap()
    }

    #[test]
    fn write_frame_layout() {
        let frame = WriteRegisters {
            address: address(3),
            start: 0x11,
            payload: &[0x01],
        }
        .encode();
        assert_eq!(frame.len(), 7);
        assert_eq!(&frame[..5], &[0x03, 0x10, 0x11, 0x01, 0x01]);
        assert!(codec::validate(&frame));
    }

    #[test]
    fn read_frame_layout() {
        let frame = ReadRegisters {
            address: address(1),
            start: 0x15,
            count: 2,
        }
        .encode();
        assert_eq!(frame.len(), 6);
        let crc = codec::compute_checksum(&[0x01, 0x03, 0x15, 0x02]).to_le_bytes();
        assert_eq!(frame.as_bytes(), &[0x01, 0x03, 0x15, 0x02, crc[0], crc[1]]);
    }

    #[test]
    #[should_panic]
    fn oversized_payload_panics() {
        WriteRegisters {
            address: address(1),
            start: 0x15,
            payload: &[0; MAX_PAYLOAD_LEN + 1],
        }
        .encode();
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(HexBytes(&[0x01, 0xAB, 0x00]).to_string(), "01 AB 00");
        assert_eq!(HexBytes(&[]).to_string(), "");
        let frame = ReadRegisters {
            address: address(1),
            start: 0x15,
            count: 2,
        }
        .encode();
        assert!(format!("{frame:?}").starts_with("Frame(01 03 15 02 "));
    }
}
