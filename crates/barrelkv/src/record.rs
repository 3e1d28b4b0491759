//! The on-disk record format: header + key + value, CRC-protected.
//!
//! # Layout (big-endian, bit-exact with `SPEC_FULL.md` §3)
//!
//! ```text
//! [crc32:u32][key_size:u8][value_size:u32][tombstone:u8][reserved:7B][key][value]
//!      4           1             4              1            7      var   var
//! ```
//!
//! The CRC covers every byte after the CRC field through the end of the
//! body (key + value). A tombstone record carries a zero-length value;
//! its `key_size` may still be nonzero.

use bytes::Bytes;

use crate::{Error, FileId};

/// Size of the fixed record header in bytes.
pub const HEADER_SIZE: usize = 17;

const CRC_SIZE: usize = 4;
const KEY_SIZE_SIZE: usize = 1;
const VALUE_SIZE_SIZE: usize = 4;
const TOMBSTONE_SIZE: usize = 1;
const RESERVED_SIZE: usize = 7;

const _: () = assert!(
    CRC_SIZE + KEY_SIZE_SIZE + VALUE_SIZE_SIZE + TOMBSTONE_SIZE + RESERVED_SIZE == HEADER_SIZE
);

/// Maximum key length permitted by the on-disk `key_size: u8` field.
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

/// A single decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
    pub tombstone: bool,
}

impl Record {
    /// Computes the on-disk size of a record with the given key/value
    /// lengths, without constructing one.
    pub fn size_of(key_len: usize, value_len: usize) -> u32 {
        (HEADER_SIZE + key_len + value_len) as u32
    }

    /// Encodes a put record.
    pub fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
        encode(key, value, false)
    }

    /// Encodes a tombstone record for `key` (empty value).
    pub fn encode_tombstone(key: &[u8]) -> Vec<u8> {
        encode(key, &[], true)
    }

    /// Decodes a record from `data`, which must contain at least
    /// `Self::size_of(..)` bytes for the record it encodes.
    ///
    /// Returns the decoded record; callers already know the expected
    /// size from the index/hint locator, so there is no length-prefix
    /// ambiguity to resolve here.
    pub fn decode(data: &Bytes, file_id: FileId, offset: u64) -> Result<Self, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Corrupt {
                file_id,
                offset,
                reason: "record shorter than header",
            });
        }

        let stored_crc = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let key_size = data[4] as usize;
        let value_size = u32::from_be_bytes(data[5..9].try_into().unwrap()) as usize;
        let tombstone = data[9] != 0;

        let body_start = HEADER_SIZE;
        let body_end = body_start + key_size + value_size;
        if data.len() < body_end {
            return Err(Error::Corrupt {
                file_id,
                offset,
                reason: "record truncated before end of body",
            });
        }

        let computed_crc = crc32fast::hash(&data[4..body_end]);
        if computed_crc != stored_crc {
            return Err(Error::Corrupt {
                file_id,
                offset,
                reason: "crc mismatch",
            });
        }

        let key = data.slice(body_start..body_start + key_size);
        let value = data.slice(body_start + key_size..body_end);

        Ok(Record {
            key,
            value,
            tombstone,
        })
    }
}

/// Decodes every whole record in `data` in order, starting at offset 0.
///
/// Stops silently at the first record whose header or body doesn't
/// fully fit in the remaining bytes (a torn trailing write); a
/// structurally complete record with a bad CRC still propagates as
/// `Error::Corrupt`, since that can only mean mid-file corruption.
/// Returns each record alongside its offset and on-disk size.
pub(crate) fn decode_sequential(
    data: &Bytes,
    file_id: FileId,
) -> Result<Vec<(Record, u64, u32)>, Error> {
    let mut out = Vec::new();
    let mut offset = 0u64;

    while (offset as usize) < data.len() {
        let remaining = &data[offset as usize..];
        if remaining.len() < HEADER_SIZE {
            break;
        }
        let key_size = remaining[4] as usize;
        let value_size = u32::from_be_bytes(remaining[5..9].try_into().unwrap()) as usize;
        let record_size = HEADER_SIZE + key_size + value_size;
        if remaining.len() < record_size {
            break;
        }

        let record_bytes = data.slice(offset as usize..offset as usize + record_size);
        let record = Record::decode(&record_bytes, file_id, offset)?;
        out.push((record, offset, record_size as u32));
        offset += record_size as u64;
    }

    Ok(out)
}

fn encode(key: &[u8], value: &[u8], tombstone: bool) -> Vec<u8> {
    debug_assert!(key.len() <= MAX_KEY_LEN, "key length must fit in u8");

    let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + value.len());
    // Reserve space for the CRC; filled in once the rest is written.
    buf.extend_from_slice(&[0u8; CRC_SIZE]);
    buf.push(key.len() as u8);
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.push(u8::from(tombstone));
    buf.extend_from_slice(&[0u8; RESERVED_SIZE]);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let crc = crc32fast::hash(&buf[CRC_SIZE..]);
    buf[0..CRC_SIZE].copy_from_slice(&crc.to_be_bytes());

    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid() -> FileId {
        FileId::new(0)
    }

    #[test]
    fn put_roundtrip() {
        let bytes = Record::encode_put(b"hello", b"world");
        assert_eq!(bytes.len(), Record::size_of(5, 5) as usize);
        let record = Record::decode(&Bytes::from(bytes), fid(), 0).unwrap();
        assert_eq!(&record.key[..], b"hello");
        assert_eq!(&record.value[..], b"world");
        assert!(!record.tombstone);
    }

    #[test]
    fn tombstone_has_empty_value() {
        let bytes = Record::encode_tombstone(b"gone");
        let record = Record::decode(&Bytes::from(bytes), fid(), 0).unwrap();
        assert_eq!(&record.key[..], b"gone");
        assert!(record.value.is_empty());
        assert!(record.tombstone);
    }

    #[test]
    fn empty_key_and_value() {
        let bytes = Record::encode_put(b"", b"");
        assert_eq!(bytes.len(), HEADER_SIZE);
        let record = Record::decode(&Bytes::from(bytes), fid(), 0).unwrap();
        assert!(record.key.is_empty());
        assert!(record.value.is_empty());
    }

    #[test]
    fn crc_mismatch_is_corrupt() {
        let mut bytes = Record::encode_put(b"k", b"v");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = Record::decode(&Bytes::from(bytes), fid(), 7).unwrap_err();
        match err {
            Error::Corrupt {
                file_id,
                offset,
                reason,
            } => {
                assert_eq!(file_id, fid());
                assert_eq!(offset, 7);
                assert_eq!(reason, "crc mismatch");
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn truncated_header_is_corrupt() {
        let bytes = vec![0u8; HEADER_SIZE - 1];
        let err = Record::decode(&Bytes::from(bytes), fid(), 0).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn truncated_body_is_corrupt() {
        let mut bytes = Record::encode_put(b"key", b"value");
        bytes.truncate(bytes.len() - 2);
        let err = Record::decode(&Bytes::from(bytes), fid(), 0).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn size_of_matches_encoded_length() {
        let bytes = Record::encode_put(b"abcdef", b"0123456789");
        assert_eq!(bytes.len() as u32, Record::size_of(6, 10));
    }
}
