//! Wire framing used by the splitflap firmware.
//!
//! Frame format:
//! - PAYLOAD (n bytes): a serialized protobuf message
//! - CRC32 (4 bytes, little endian): IEEE 802.3 CRC of PAYLOAD
//!
//! The whole (PAYLOAD + CRC32) is COBS encoded, so it never contains a zero byte, and is followed
//! by a single 0x00 delimiter.

use crate::errors::{Error, ProtocolError};

/// Frame delimiter.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Size of the trailing checksum.
pub const CRC_SIZE: usize = 4;

/// Longest frame body accepted by [`FrameDecoder`]: the biggest state of a full chain fits in it.
pub const MAX_FRAME_SIZE: usize = 4096;

/// IEEE 802.3 CRC32 (the one used by zlib).
pub fn crc32(data: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB88320;
    let mut crc = 0xFFFFFFFF;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}

/// Consistent Overhead Byte Stuffing: removes all zero bytes from `data`.
/// <https://en.wikipedia.org/wiki/Consistent_Overhead_Byte_Stuffing>
pub fn cobs_encode(data: &[u8]) -> Vec<u8> {
    cobs::encode_vec(data)
}

/// Reverses [`cobs_encode`].
///
/// # Errors
/// * `InvalidFraming`: a block points past the end of `data`.
pub fn cobs_decode(data: &[u8]) -> Result<Vec<u8>, Error> {
    cobs::decode_vec(data).map_err(|_| ProtocolError::InvalidFraming.into())
}

/// Builds the complete wire frame for `payload` (delimiter included).
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(payload.len() + CRC_SIZE);
    data.extend_from_slice(payload);
    data.extend_from_slice(&crc32(payload).to_le_bytes());

    let mut frame = cobs_encode(&data);
    frame.push(FRAME_DELIMITER);
    frame
}

/// Extracts the payload out of a frame body (delimiter excluded).
///
/// # Errors
/// * `InvalidFraming`: the COBS encoding is broken.
/// * `MessageTooShort`: the decoded frame cannot even hold a checksum.
/// * `ChecksumMismatch`: the payload has been corrupted.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, Error> {
    let mut data = cobs_decode(frame)?;
    if data.len() < CRC_SIZE {
        return Err(ProtocolError::MessageTooShort {
            operation: "decode_frame",
            expected: CRC_SIZE,
            received: data.len(),
        }
        .into());
    }

    let split = data.len() - CRC_SIZE;
    let received = u32::from_le_bytes([data[split], data[split + 1], data[split + 2], data[split + 3]]);
    data.truncate(split);

    let expected = crc32(&data);
    if expected != received {
        return Err(ProtocolError::ChecksumMismatch { expected, received }.into());
    }
    Ok(data)
}

/// Incremental frame decoder: feed it bytes as they arrive from the transport.
///
/// A frame growing past [`MAX_FRAME_SIZE`] is reported once, then its bytes are skipped up to
/// the next delimiter.
#[derive(Clone, Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    discarding: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulates `byte`. Returns the decoded payload (or the decoding error) each time a frame
    /// delimiter closes a non-empty frame.
    pub fn feed(&mut self, byte: u8) -> Option<Result<Vec<u8>, Error>> {
        if byte == FRAME_DELIMITER {
            if std::mem::take(&mut self.discarding) || self.buffer.is_empty() {
                return None;
            }
            let frame = std::mem::take(&mut self.buffer);
            return Some(decode_frame(&frame));
        }
        if self.discarding {
            return None;
        }

        self.buffer.push(byte);
        if self.buffer.len() > MAX_FRAME_SIZE {
            self.buffer = Vec::new();
            self.discarding = true;
            return Some(Err(ProtocolError::FrameTooLong {
                max: MAX_FRAME_SIZE,
            }
            .into()));
        }
        None
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
