//! Register-read request frames and reply validation.
//!
//! The sensor speaks a Modbus-RTU style protocol: a request is
//! `[address, function, register_hi, register_lo, count_hi, count_lo, crc_lo, crc_hi]`
//! and a reply is `[address, function, byte_count, data..., crc_lo, crc_hi]`
//! where `data` is `count` big-endian 16-bit words.
//!
//! Everything above this module treats frames as opaque byte strings plus an
//! expected reply length.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Function code for "read holding registers".
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Bytes in a reply that are not payload: address, function, byte count, CRC.
const REPLY_OVERHEAD: usize = 5;

/// Offset of the first payload byte in a reply.
const PAYLOAD_OFFSET: usize = 3;

/// Describes a register read: which device, which function, which registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSpec {
    /// Bus address of the device.
    pub address: u8,
    /// Function code (normally [`READ_HOLDING_REGISTERS`]).
    #[serde(default = "default_function")]
    pub function: u8,
    /// First register to read.
    pub register: u16,
    /// Number of 16-bit registers to read.
    pub count: u16,
}

fn default_function() -> u8 {
    READ_HOLDING_REGISTERS
}

impl FrameSpec {
    /// Creates a holding-register read of `count` registers at `register`.
    pub fn read(address: u8, register: u16, count: u16) -> Self {
        Self {
            address,
            function: READ_HOLDING_REGISTERS,
            register,
            count,
        }
    }

    /// Encodes the request frame, checksum included.
    pub fn encode(&self) -> Vec<u8> {
        let [reg_hi, reg_lo] = self.register.to_be_bytes();
        let [count_hi, count_lo] = self.count.to_be_bytes();
        let mut frame = vec![
            self.address,
            self.function,
            reg_hi,
            reg_lo,
            count_hi,
            count_lo,
        ];
        append_crc(&mut frame);
        frame
    }

    /// Length in bytes of a well-formed reply to this request.
    pub fn reply_len(&self) -> usize {
        REPLY_OVERHEAD + 2 * usize::from(self.count)
    }

    /// Builds the reply a device would send for this request.
    ///
    /// Used by simulators and test transports. `words` should hold exactly
    /// `count` values; extra words are ignored and missing ones are zero.
    #[allow(clippy::cast_possible_truncation)] // byte count of a u16 register count fits after clamping
    pub fn reply(&self, words: &[u16]) -> Vec<u8> {
        let count = usize::from(self.count);
        let byte_count = (2 * count).min(usize::from(u8::MAX)) as u8;
        let mut frame = Vec::with_capacity(self.reply_len());
        frame.extend_from_slice(&[self.address, self.function, byte_count]);
        for i in 0..count {
            let word = words.get(i).copied().unwrap_or(0);
            frame.extend_from_slice(&word.to_be_bytes());
        }
        append_crc(&mut frame);
        frame
    }
}

/// Computes the CRC-16/MODBUS checksum (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Appends the checksum, low byte first.
fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Reads payload word `word` from a reply, if present. The checksum
/// trailer is never part of the payload.
pub fn payload_word(reply: &[u8], word: usize) -> Option<u16> {
    let payload = reply.get(..reply.len().checked_sub(2)?)?;
    let start = PAYLOAD_OFFSET + 2 * word;
    let bytes = payload.get(start..start + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Checks that `reply` is a valid answer to `request`.
///
/// The caller has already read the expected number of bytes. This verifies
/// the echoed address and function, the byte-count field, and the trailing
/// checksum.
///
/// # Errors
///
/// Returns [`TransportError`] describing the first violation found.
pub fn check_reply(request: &[u8], reply: &[u8]) -> Result<(), TransportError> {
    if reply.len() < REPLY_OVERHEAD {
        return Err(TransportError::ShortReply {
            expected: REPLY_OVERHEAD,
            received: reply.len(),
        });
    }

    let (body, trailer) = reply.split_at(reply.len() - 2);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = crc16(body);
    if computed != received {
        return Err(TransportError::ChecksumMismatch { computed, received });
    }

    if request.len() >= 2 && (body[0] != request[0] || body[1] != request[1]) {
        return Err(TransportError::UnexpectedReply {
            reason: format!(
                "reply from {:#04x}/{:#04x} does not answer request to {:#04x}/{:#04x}",
                body[0], body[1], request[0], request[1]
            ),
        });
    }

    let payload_len = reply.len() - REPLY_OVERHEAD;
    if usize::from(body[2]) != payload_len {
        return Err(TransportError::UnexpectedReply {
            reason: format!(
                "byte count field is {} but payload is {payload_len} bytes",
                body[2]
            ),
        });
    }

    Ok(())
}
