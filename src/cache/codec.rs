//! Record framing for cache files.
//!
//! Every record in a log or snapshot file is framed as:
//!
//! ```text
//! [version: 1 byte][length: 4 bytes LE][payload: N bytes JSON][crc32: 4 bytes LE]
//! ```
//!
//! and every file starts with a 4-byte magic and the codec version.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current record format version.
pub const CODEC_VERSION: u8 = 1;

/// Magic bytes at the start of every cache file.
pub const MAGIC: [u8; 4] = *b"SWPC";

/// Size of the file header in bytes.
pub const HEADER_LEN: u64 = 5;

/// Largest payload accepted on read (100 MB).
pub const MAX_RECORD_SIZE: usize = 100 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Serializes `value` into one framed record.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("cannot serialize record: {e}")))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| invalid(format!("record of {} bytes is too large", payload.len())))?;

    let mut out = Vec::with_capacity(payload.len() + 9);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(out)
}

/// Reads and verifies one framed record.
///
/// A record cut short by end-of-file yields `ErrorKind::UnexpectedEof`;
/// a checksum, version or payload failure yields `ErrorKind::InvalidData`.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported record version {} (expected {CODEC_VERSION})",
            version[0]
        )));
    }

    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(invalid(format!(
            "record size {len} exceeds maximum {MAX_RECORD_SIZE}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut stored = [0u8; 4];
    reader.read_exact(&mut stored)?;
    let stored = u32::from_le_bytes(stored);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    serde_json::from_slice(&payload).map_err(|e| invalid(format!("cannot deserialize record: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[CODEC_VERSION])
}

/// Reads and checks the file header, returning its version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid(format!("not a cache file (magic {magic:?})")));
    }
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != CODEC_VERSION {
        return Err(invalid(format!("unsupported file version {}", version[0])));
    }
    Ok(version[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip_value() {
        let value = Value::Float(f64::NAN);
        let encoded = encode(&value).unwrap();
        let decoded: Value = decode(&mut Cursor::new(encoded)).unwrap();
        assert!(decoded.as_float().unwrap().is_nan());
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&"cached result".to_string()).unwrap();
        encoded[7] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(encoded)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_record_is_eof() {
        let encoded = encode(&"cached result".to_string()).unwrap();
        let cut = encoded[..encoded.len() - 3].to_vec();
        let err = decode::<String>(&mut Cursor::new(cut)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_oversized_record() {
        let mut bad = vec![CODEC_VERSION];
        bad.extend_from_slice(&200_000_000u32.to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(read_header(&mut Cursor::new(buf)).unwrap(), CODEC_VERSION);

        let err = read_header(&mut Cursor::new(b"KYRO\x01".to_vec())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
