//! Hint files: compact (key, locator, tombstone) sidecars written once a
//! data file is sealed, read once during recovery.
//!
//! # Entry layout (big-endian)
//!
//! ```text
//! [key_size:u8][record_size:u32][record_offset:u64][tombstone:u8][key]
//! ```
//!
//! Hint files are write-once, read-many. A truncated trailing entry (a
//! torn write at seal time) is silently discarded rather than treated as
//! corruption — see `SPEC_FULL.md` §3 and spec.md §7.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::Bytes;

use crate::error::Error;
use crate::record::MAX_KEY_LEN;

const ENTRY_HEADER_SIZE: usize = 1 + 4 + 8 + 1;

/// A single hint file entry: everything recovery needs to repopulate the
/// key index without touching the data file it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintEntry {
    pub key: Bytes,
    pub record_offset: u64,
    pub record_size: u32,
    pub tombstone: bool,
}

/// Streams hint entries to a fresh `<id>.hint` file as its paired data
/// file is sealed.
pub struct HintWriter {
    writer: BufWriter<File>,
}

impl HintWriter {
    pub fn create(path: &Path) -> Result<Self, Error> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, path: &Path, entry: &HintEntry) -> Result<(), Error> {
        debug_assert!(entry.key.len() <= MAX_KEY_LEN, "key length must fit in u8");

        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + entry.key.len());
        buf.push(entry.key.len() as u8);
        buf.extend_from_slice(&entry.record_size.to_be_bytes());
        buf.extend_from_slice(&entry.record_offset.to_be_bytes());
        buf.push(u8::from(entry.tombstone));
        buf.extend_from_slice(&entry.key);

        self.writer
            .write_all(&buf)
            .map_err(|e| Error::io(path, e))
    }

    /// Flushes buffered writes. The caller fsyncs the underlying file
    /// descriptor as part of sealing the paired data file.
    pub fn finish(mut self, path: &Path) -> Result<(), Error> {
        self.writer.flush().map_err(|e| Error::io(path, e))
    }
}

/// Reads every well-formed entry from a hint file in append order.
///
/// Stops at the first entry that doesn't fully fit in the remaining
/// bytes — a truncated tail from a torn write, not a corruption error.
pub fn read_entries(path: &Path) -> Result<Vec<HintEntry>, Error> {
    let data: Bytes = fs::read(path).map_err(|e| Error::io(path, e))?.into();
    Ok(parse_entries(&data))
}

fn parse_entries(data: &Bytes) -> Vec<HintEntry> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos + ENTRY_HEADER_SIZE <= data.len() {
        let key_size = data[pos] as usize;
        let record_size = u32::from_be_bytes(data[pos + 1..pos + 5].try_into().unwrap());
        let record_offset = u64::from_be_bytes(data[pos + 5..pos + 13].try_into().unwrap());
        let tombstone = data[pos + 13] != 0;

        let key_start = pos + ENTRY_HEADER_SIZE;
        let key_end = key_start + key_size;
        if key_end > data.len() {
            break;
        }

        entries.push(HintEntry {
            key: data.slice(key_start..key_end),
            record_offset,
            record_size,
            tombstone,
        });
        pos = key_end;
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_multiple_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.hint");

        let mut writer = HintWriter::create(&path).unwrap();
        writer
            .append(
                &path,
                &HintEntry {
                    key: Bytes::from_static(b"a"),
                    record_offset: 0,
                    record_size: 20,
                    tombstone: false,
                },
            )
            .unwrap();
        writer
            .append(
                &path,
                &HintEntry {
                    key: Bytes::from_static(b"bb"),
                    record_offset: 20,
                    record_size: 25,
                    tombstone: true,
                },
            )
            .unwrap();
        writer.finish(&path).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(&entries[0].key[..], b"a");
        assert_eq!(entries[0].record_offset, 0);
        assert!(!entries[0].tombstone);
        assert_eq!(&entries[1].key[..], b"bb");
        assert!(entries[1].tombstone);
    }

    #[test]
    fn truncated_trailing_entry_is_discarded_not_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.hint");

        let mut writer = HintWriter::create(&path).unwrap();
        writer
            .append(
                &path,
                &HintEntry {
                    key: Bytes::from_static(b"whole"),
                    record_offset: 0,
                    record_size: 10,
                    tombstone: false,
                },
            )
            .unwrap();
        writer.finish(&path).unwrap();

        // Simulate a torn write: append a partial second entry.
        let mut bytes = fs::read(&path).unwrap();
        bytes.extend_from_slice(&[3, 0, 0]); // incomplete header
        fs::write(&path, bytes).unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(&entries[0].key[..], b"whole");
    }

    #[test]
    fn empty_file_yields_no_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.hint");
        File::create(&path).unwrap();
        assert!(read_entries(&path).unwrap().is_empty());
    }
}
