//! Data files: the append-only log segments that hold records.
//!
//! An [`ActiveFile`] accepts appends from the single writer thread. Once
//! rolled over it becomes a [`SealedFile`]: read-only, positional-read
//! only, safe to share across reader threads without any lock covering
//! the read itself.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::error::Error;
use crate::locator::FileId;

/// Returns the on-disk path for a data file with the given id.
pub fn data_path(dir: &Path, file_id: FileId) -> PathBuf {
    dir.join(format!("{file_id}.data"))
}

/// Returns the on-disk path for the hint file paired with `file_id`.
pub fn hint_path(dir: &Path, file_id: FileId) -> PathBuf {
    dir.join(format!("{file_id}.hint"))
}

/// The currently writable data file. Exclusively owned by the `Engine`;
/// there is no requirement for writer parallelism (spec.md §5).
#[derive(Debug)]
pub struct ActiveFile {
    file_id: FileId,
    path: PathBuf,
    file: File,
    write_offset: u64,
}

impl ActiveFile {
    /// Creates `<file_id>.data` for append, starting at offset 0.
    pub fn create(dir: &Path, file_id: FileId) -> Result<Self, Error> {
        let path = data_path(dir, file_id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        Ok(Self {
            file_id,
            path,
            file,
            write_offset: 0,
        })
    }

    /// Reopens a file that was still active when the process last shut
    /// down uncleanly (no paired hint). Appends continue from its
    /// current length.
    pub fn reopen(dir: &Path, file_id: FileId) -> Result<Self, Error> {
        let path = data_path(dir, file_id);
        let file = OpenOptions::new()
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        let write_offset = file.metadata().map_err(|e| Error::io(&path, e))?.len();
        Ok(Self {
            file_id,
            path,
            file,
            write_offset,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Whether appending `incoming_len` more bytes would exceed
    /// `max_size`. The incoming record is never split across files.
    pub fn would_exceed(&self, incoming_len: u64, max_size: u64) -> bool {
        self.write_offset + incoming_len > max_size
    }

    /// Appends `bytes` at the current write offset. Returns the offset
    /// the record now starts at (the pre-append offset).
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, Error> {
        let offset = self.write_offset;
        self.file
            .write_all_at(bytes, offset)
            .map_err(|e| Error::io(&self.path, e))?;
        self.write_offset += bytes.len() as u64;
        Ok(offset)
    }

    /// Reads a record already known to have been written at `offset`.
    /// Used by `get` when the locator resolves to the still-active file.
    pub fn read(&self, offset: u64, size: u32) -> Result<Bytes, Error> {
        read_at(&self.file, &self.path, self.file_id, offset, size)
    }

    /// Flushes and fsyncs, then returns the path so the caller can finish
    /// sealing (writing the paired hint file) before reopening this path
    /// read-only as a [`SealedFile`].
    pub fn seal(self) -> Result<SealedFile, Error> {
        self.file.sync_all().map_err(|e| Error::io(&self.path, e))?;
        let size = self.write_offset;
        let file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(SealedFile {
            file_id: self.file_id,
            path: self.path,
            file,
            size,
        })
    }
}

/// A sealed, immutable data file. Once created it is either read via
/// positional reads or deleted whole; its bytes never change.
#[derive(Debug)]
pub struct SealedFile {
    file_id: FileId,
    path: PathBuf,
    file: File,
    size: u64,
}

impl SealedFile {
    /// Opens an existing `<file_id>.data` for positional reads only.
    pub fn open(dir: &Path, file_id: FileId) -> Result<Self, Error> {
        let path = data_path(dir, file_id);
        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| Error::io(&path, e))?;
        let size = file.metadata().map_err(|e| Error::io(&path, e))?.len();
        Ok(Self {
            file_id,
            path,
            file,
            size,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read(&self, offset: u64, size: u32) -> Result<Bytes, Error> {
        read_at(&self.file, &self.path, self.file_id, offset, size)
    }

    /// Unlinks this data file and its hint sibling, if present.
    pub fn delete(&self) -> Result<(), Error> {
        std::fs::remove_file(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let hint = hint_path(self.path.parent().unwrap_or(Path::new(".")), self.file_id);
        match std::fs::remove_file(&hint) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(&hint, e)),
        }
    }

    /// Reads the whole file for a full scan (recovery of an unhinted
    /// data file, or compaction of a victim file).
    pub fn read_all(&self) -> Result<Bytes, Error> {
        let mut buf = vec![0u8; self.size as usize];
        self.file
            .read_exact_at(&mut buf, 0)
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(Bytes::from(buf))
    }
}

fn read_at(
    file: &File,
    path: &Path,
    file_id: FileId,
    offset: u64,
    size: u32,
) -> Result<Bytes, Error> {
    let mut buf = vec![0u8; size as usize];
    match file.read_exact_at(&mut buf, offset) {
        Ok(()) => Ok(Bytes::from(buf)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::Corrupt {
            file_id,
            offset,
            reason: "eof reached before expected record size",
        }),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_read_back() {
        let dir = tempdir().unwrap();
        let mut active = ActiveFile::create(dir.path(), FileId::new(0)).unwrap();

        let off1 = active.append(b"hello").unwrap();
        let off2 = active.append(b"world!").unwrap();
        assert_eq!(off1, 0);
        assert_eq!(off2, 5);

        assert_eq!(&active.read(off1, 5).unwrap()[..], b"hello");
        assert_eq!(&active.read(off2, 6).unwrap()[..], b"world!");
    }

    #[test]
    fn would_exceed_respects_max_size() {
        let dir = tempdir().unwrap();
        let mut active = ActiveFile::create(dir.path(), FileId::new(0)).unwrap();
        active.append(&[0u8; 100]).unwrap();

        assert!(!active.would_exceed(28, 128));
        assert!(active.would_exceed(29, 128));
    }

    #[test]
    fn seal_then_read_as_sealed() {
        let dir = tempdir().unwrap();
        let mut active = ActiveFile::create(dir.path(), FileId::new(1)).unwrap();
        let off = active.append(b"payload").unwrap();
        let sealed = active.seal().unwrap();

        assert_eq!(sealed.size(), 7);
        assert_eq!(&sealed.read(off, 7).unwrap()[..], b"payload");
    }

    #[test]
    fn read_past_eof_is_corrupt() {
        let dir = tempdir().unwrap();
        let mut active = ActiveFile::create(dir.path(), FileId::new(0)).unwrap();
        active.append(b"abc").unwrap();
        let sealed = active.seal().unwrap();

        let err = sealed.read(0, 10).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }));
    }

    #[test]
    fn delete_removes_data_and_hint() {
        let dir = tempdir().unwrap();
        let mut active = ActiveFile::create(dir.path(), FileId::new(2)).unwrap();
        active.append(b"x").unwrap();
        let sealed = active.seal().unwrap();

        std::fs::write(hint_path(dir.path(), FileId::new(2)), b"hint").unwrap();
        sealed.delete().unwrap();

        assert!(!data_path(dir.path(), FileId::new(2)).exists());
        assert!(!hint_path(dir.path(), FileId::new(2)).exists());
    }

    #[test]
    fn reopen_active_file_continues_at_its_length() {
        let dir = tempdir().unwrap();
        {
            let mut active = ActiveFile::create(dir.path(), FileId::new(0)).unwrap();
            active.append(b"12345").unwrap();
        }
        let mut reopened = ActiveFile::reopen(dir.path(), FileId::new(0)).unwrap();
        assert_eq!(reopened.write_offset(), 5);
        let off = reopened.append(b"67").unwrap();
        assert_eq!(off, 5);
    }
}
