//! Modbus CRC-16 over raw frame bytes.
//!
//! Polynomial `0xA001` (reflected `0x8005`), initial register `0xFFFF`. The
//! checksum trails a frame low byte first.

use crc::{CRC_16_MODBUS, Crc};

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Number of checksum bytes at the end of a frame.
pub const CHECKSUM_LEN: usize = 2;

/// Computes the Modbus CRC-16 of `bytes`.
pub fn compute_checksum(bytes: &[u8]) -> u16 {
    CRC_MODBUS.checksum(bytes)
}

/// Writes the checksum of `buffer[..coverage]` into `buffer[coverage..coverage + 2]`.
///
/// # Panics
///
/// Panics if `buffer` is shorter than `coverage + 2`.
pub fn append_checksum(buffer: &mut [u8], coverage: usize) {
    let crc = compute_checksum(&buffer[..coverage]);
    buffer[coverage..coverage + CHECKSUM_LEN].copy_from_slice(&crc.to_le_bytes());
}

/// Returns `true` if the trailing two bytes of `frame` hold the checksum of everything before them.
///
/// Frames shorter than three bytes are never valid.
pub fn validate(frame: &[u8]) -> bool {
    if frame.len() <= CHECKSUM_LEN {
        return false;
    }
    let (body, trailer) = frame.split_at(frame.len() - CHECKSUM_LEN);
    compute_checksum(body).to_le_bytes() == trailer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(compute_checksum(b"123456789"), 0x4B37);
        // Classic Modbus read request, transmitted as `... C5 CD`.
        assert_eq!(
            compute_checksum(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]),
            0xCDC5
        );
        assert_eq!(compute_checksum(&[]), 0xFFFF);
    }

    #[test]
    fn deterministic_and_order_sensitive() {
        let data = [0x01, 0x10, 0x15, 0x02, 0x35, 0x01];
        assert_eq!(compute_checksum(&data), compute_checksum(&data));

        let mut swapped = data;
        swapped.swap(4, 5);
        assert_ne!(compute_checksum(&data), compute_checksum(&swapped));

        for i in 0..data.len() {
            let mut changed = data;
            changed[i] ^= 0x01;
            assert_ne!(compute_checksum(&data), compute_checksum(&changed));
        }
    }

    #[test]
    fn append_then_validate() {
        let payloads: [&[u8]; 4] = [
            &[0x00],
            &[0xFF, 0xFF, 0xFF],
            &[0x01, 0x03, 0x15, 0x02],
            &[0x06, 0x10, 0x11, 0x01, 0x01],
        ];
        for payload in payloads {
            let mut buffer = payload.to_vec();
            buffer.extend_from_slice(&[0, 0]);
            append_checksum(&mut buffer, payload.len());
            assert!(validate(&buffer), "{buffer:02x?}");
        }
    }

    #[test]
    fn append_writes_low_byte_first() {
        let mut buffer = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00];
        append_checksum(&mut buffer, 6);
        assert_eq!(&buffer[6..], &[0xC5, 0xCD]);
    }

    #[test]
    fn append_leaves_bytes_after_checksum_untouched() {
        let mut buffer = [0x01, 0x03, 0x15, 0x02, 0x00, 0x00, 0xAA, 0xBB];
        append_checksum(&mut buffer, 4);
        assert_eq!(&buffer[6..], &[0xAA, 0xBB]);
    }

    #[test]
    fn single_bit_flip_is_detected() {
        let mut frame = [0x01, 0x10, 0x15, 0x02, 0x35, 0x01, 0x00, 0x00];
        append_checksum(&mut frame, 6);
        assert!(validate(&frame));
        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[byte] ^= 1 << bit;
                assert!(!validate(&corrupted), "flip byte {byte} bit {bit}");
            }
        }
    }

    #[test]
    fn short_frames_are_invalid() {
        assert!(!validate(&[]));
        assert!(!validate(&[0xFF]));
        assert!(!validate(&[0xFF, 0xFF]));
    }
}
