//! Byte-level compression of record payloads.
//!
//! A stored payload is the raw record bytes behind a single magic byte:
//! `MAGIC_RAW` for verbatim bytes, `MAGIC_DEFLATE` for a zlib stream.
//! The prefix makes decode unambiguous regardless of the threshold the
//! writer used.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::{Result, StorageError};

pub const MAGIC_RAW: u8 = 0x00;
pub const MAGIC_DEFLATE: u8 = 0x01;

/// Wrap `raw` into a prefixed payload, compressing when it is larger than
/// `threshold` and compression actually wins.
pub fn pack(raw: &[u8], threshold: usize) -> Vec<u8> {
    if raw.len() > threshold {
        let mut enc = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2 + 1), Compression::fast());
        // Writing to a Vec cannot fail.
        enc.write_all(raw).expect("write to Vec");
        let compressed = enc.finish().expect("finish to Vec");
        if compressed.len() < raw.len() {
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(MAGIC_DEFLATE);
            out.extend_from_slice(&compressed);
            return out;
        }
    }
    let mut out = Vec::with_capacity(raw.len() + 1);
    out.push(MAGIC_RAW);
    out.extend_from_slice(raw);
    out
}

/// Recover the raw record bytes from a prefixed payload.
pub fn unpack(payload: &[u8]) -> Result<Vec<u8>> {
    match payload.split_first() {
        Some((&MAGIC_RAW, rest)) => Ok(rest.to_vec()),
        Some((&MAGIC_DEFLATE, rest)) => {
            let mut out = Vec::new();
            ZlibDecoder::new(rest)
                .read_to_end(&mut out)
                .map_err(|e| StorageError::BadPayload(format!("bad deflate stream: {e}")))?;
            Ok(out)
        }
        Some((&magic, _)) => Err(StorageError::BadPayload(format!("unknown payload magic {magic:#04x}"))),
        None => Err(StorageError::BadPayload("empty payload".into())),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn small_stays_raw() {
        let raw = b"x=1";
        let payload = pack(raw, 8192);
        assert_eq!(payload[0], MAGIC_RAW);
        assert_eq!(unpack(&payload).unwrap(), raw);
    }

    #[test]
    fn large_compresses_and_round_trips() {
        let raw = vec![b'a'; 64 * 1024];
        let payload = pack(&raw, 8192);
        assert_eq!(payload[0], MAGIC_DEFLATE);
        assert!(payload.len() < raw.len());
        assert_eq!(unpack(&payload).unwrap(), raw);
    }

    #[test]
    fn incompressible_input_stays_raw_even_above_threshold() {
        use rand::Rng as _;

        // Random bytes do not deflate; the prefix must say so.
        let mut rng = rand::rng();
        let raw: Vec<u8> = (0..1024).map(|_| rng.random()).collect();
        let payload = pack(&raw, 16);
        assert_eq!(unpack(&payload).unwrap(), raw);
    }

    #[test]
    fn empty_and_garbage_payloads_rejected() {
        assert!(unpack(&[]).is_err());
        assert!(unpack(&[0x7f, 1, 2]).is_err());
        assert!(unpack(&[MAGIC_DEFLATE, 0xde, 0xad]).is_err());
    }
}
