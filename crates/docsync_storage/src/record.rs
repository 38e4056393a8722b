//! Framing of persistence log records.
//!
//! ```text
//! | magic (4) | payload length (4, LE) | CRC32 of payload (4, LE) | payload |
//! ```
//!
//! The payload is a CBOR-encoded list of table operations.

use crate::error::{StorageError, StorageResult};

/// Magic bytes at the start of every record.
pub const LOG_MAGIC: [u8; 4] = *b"DSLG";

pub(crate) const HEADER_SIZE: usize = 12;

/// Frames `payload` as a log record.
pub(crate) fn encode_record(payload: &[u8]) -> StorageResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::Encoding("log record payload too large".into()))?;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&LOG_MAGIC);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&compute_crc32(payload).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Outcome of decoding one record from a byte buffer.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Decoded<'a> {
    /// A complete, valid record and the number of bytes it occupied.
    Record(&'a [u8], usize),
    /// The buffer ends in the middle of a record.
    Torn,
    /// The bytes at this position are not a valid record.
    Corrupt(String),
}

/// Decodes the record at the start of `data`.
pub(crate) fn decode_record(data: &[u8]) -> Decoded<'_> {
    if data.len() < HEADER_SIZE {
        return Decoded::Torn;
    }
    if data[..4] != LOG_MAGIC {
        return Decoded::Corrupt("bad record magic".into());
    }
    let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let crc = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    let end = HEADER_SIZE + len;
    if data.len() < end {
        return Decoded::Torn;
    }
    let payload = &data[HEADER_SIZE..end];
    if compute_crc32(payload) != crc {
        return Decoded::Corrupt("record checksum mismatch".into());
    }
    Decoded::Record(payload, end)
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn framed_record_decodes() {
        let framed = encode_record(b"payload").unwrap();
        assert_eq!(decode_record(&framed), Decoded::Record(b"payload", framed.len()));
    }

    #[test]
    fn short_buffer_is_torn() {
        let framed = encode_record(b"payload").unwrap();
        assert_eq!(decode_record(&framed[..framed.len() - 1]), Decoded::Torn);
        assert_eq!(decode_record(&framed[..5]), Decoded::Torn);
    }

    #[test]
    fn flipped_byte_is_corrupt() {
        let mut framed = encode_record(b"payload").unwrap();
        let last = framed.len() - 1;
        framed[last] ^= 0xFF;
        assert!(matches!(decode_record(&framed), Decoded::Corrupt(_)));
    }
}
