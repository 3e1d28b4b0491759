//! The storage engine: ties the record codec, data/hint files, key index
//! and stale accountant into a single `put`/`get`/`delete` API, plus
//! crash recovery and the background merge scheduler.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::data_file::{self, ActiveFile, SealedFile};
use crate::error::Error;
use crate::hint_file::{self, HintEntry, HintWriter};
use crate::index::KeyIndex;
use crate::locator::{FileId, RecordLocator};
use crate::merge::MergeScheduler;
use crate::options::Options;
use crate::record::{Record, MAX_KEY_LEN};
use crate::stale::StaleAccountant;

/// State owned by the single writer: the active file and the hint
/// entries observed for it so far.
///
/// The hint file itself is not written incrementally — only at seal
/// time, by streaming `pending_hints` in one pass (spec.md §4.2, §4.4:
/// "a paired hint file is produced when a data file is sealed"). This
/// matters for crash safety: if hint entries were flushed to disk
/// record-by-record, a process crash between a buffered write and its
/// flush could leave a `.hint` file that under-reports what is actually
/// durable in the `.data` file, and recovery would trust it as complete
/// and silently lose records. Keeping them in memory until seal means a
/// data file that never got sealed simply has no hint at all, which
/// sends it through the raw-scan recovery path instead (§4.6, §9).
pub(crate) struct WriterState {
    pub(crate) active: ActiveFile,
    pending_hints: Vec<HintEntry>,
}

/// Fields shared between the `Engine` handle and the background merge
/// thread. Kept separate from `Engine` so the merge scheduler can hold
/// an `Arc<Shared>` without holding the `Engine` itself.
pub(crate) struct Shared {
    pub(crate) dir: PathBuf,
    pub(crate) options: Options,
    pub(crate) index: KeyIndex,
    pub(crate) stale: StaleAccountant,
    pub(crate) sealed: RwLock<Arc<HashMap<FileId, Arc<SealedFile>>>>,
    pub(crate) writer: Mutex<WriterState>,
    next_file_id: AtomicU32,
}

impl Shared {
    pub(crate) fn alloc_file_id(&self) -> FileId {
        FileId::new(self.next_file_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn sealed_snapshot(&self) -> Arc<HashMap<FileId, Arc<SealedFile>>> {
        self.sealed.read().unwrap().clone()
    }

    pub(crate) fn insert_sealed(&self, file: SealedFile) {
        self.stale.register_file(file.file_id(), file.size());
        let mut guard = self.sealed.write().unwrap();
        let mut next = (**guard).clone();
        next.insert(file.file_id(), Arc::new(file));
        *guard = Arc::new(next);
    }

    /// Atomically swaps out `removed` victim files for `added` merged
    /// output files in one published snapshot.
    pub(crate) fn swap_sealed(&self, removed: &[FileId], added: Vec<SealedFile>) {
        let mut guard = self.sealed.write().unwrap();
        let mut next = (**guard).clone();
        for id in removed {
            next.remove(id);
        }
        for file in added {
            self.stale.register_file(file.file_id(), file.size());
            next.insert(file.file_id(), Arc::new(file));
        }
        *guard = Arc::new(next);
        for id in removed {
            self.stale.drop_file(*id);
        }
    }

    fn read_record(&self, locator: RecordLocator) -> Result<Record, Error> {
        let data = {
            let writer = self.writer.lock().unwrap();
            if locator.file_id == writer.active.file_id() {
                writer.active.read(locator.offset, locator.record_size)?
            } else {
                drop(writer);
                let sealed = self.sealed_snapshot();
                let file = sealed
                    .get(&locator.file_id)
                    .ok_or(Error::Inconsistent {
                        file_id: locator.file_id,
                        offset: locator.offset,
                    })?
                    .clone();
                file.read(locator.offset, locator.record_size)?
            }
        };
        Record::decode(&data, locator.file_id, locator.offset)
    }

    /// Resolves `key`'s current record, re-checking the index and
    /// retrying if the file its locator pointed at has just been
    /// retired by a concurrent merge.
    ///
    /// `get` looks up a key's locator and only afterward, as a separate
    /// step, resolves the file it lives in. A full merge round (CAS
    /// relocation + publish + delete) can complete entirely in that gap,
    /// so a bare miss on the sealed-file snapshot doesn't mean the key's
    /// record was actually lost — it usually just means the merger
    /// moved it, and the index already reflects the new locator. Only
    /// if the index still names the very locator we failed to resolve
    /// is this a genuine `Inconsistent` bug rather than an ordinary race
    /// with compaction (spec.md §4.6).
    fn read_current(&self, key: &[u8]) -> Result<Option<Record>, Error> {
        const MAX_ATTEMPTS: usize = 8;

        let Some(mut locator) = self.index.get(key) else {
            return Ok(None);
        };

        for _ in 0..MAX_ATTEMPTS {
            match self.read_record(locator) {
                Ok(record) => return Ok(Some(record)),
                Err(Error::Inconsistent { .. }) => match self.index.get(key) {
                    None => return Ok(None),
                    Some(current) if current != locator => {
                        locator = current;
                        continue;
                    }
                    Some(_) => {
                        return Err(Error::Inconsistent {
                            file_id: locator.file_id,
                            offset: locator.offset,
                        });
                    }
                },
                Err(other) => return Err(other),
            }
        }

        Err(Error::Inconsistent {
            file_id: locator.file_id,
            offset: locator.offset,
        })
    }
}

/// An open instance of the store, rooted at a single directory.
///
/// Cloning is not supported; share an `Engine` across threads behind an
/// `Arc` if needed. The background merge thread runs for the lifetime
/// of the `Engine` and is joined by `close`.
pub struct Engine {
    shared: Arc<Shared>,
    merge: Option<MergeScheduler>,
}

fn check_key_len(key: &[u8]) -> Result<(), Error> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKey {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

struct DiscoveredFiles {
    data_ids: Vec<FileId>,
    has_hint: HashMap<FileId, bool>,
}

fn discover_files(dir: &Path) -> Result<DiscoveredFiles, Error> {
    let mut data_ids = Vec::new();
    let mut has_hint = HashMap::new();

    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(id) = stem.parse::<u32>() else {
            continue;
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some("data") => data_ids.push(FileId::new(id)),
            Some("hint") => {
                has_hint.insert(FileId::new(id), true);
            }
            _ => {}
        }
    }
    data_ids.sort();
    Ok(DiscoveredFiles { data_ids, has_hint })
}

/// Scans a data file record-by-record, tolerating a truncated trailing
/// record (torn write) but propagating a mid-file CRC mismatch as
/// `Error::Corrupt`. Returns the entries that would have gone to the
/// paired hint file, plus the offset just past the last whole record.
fn scan_data_file(file: &SealedFile) -> Result<(Vec<HintEntry>, u64), Error> {
    let data = file.read_all()?;
    let decoded = crate::record::decode_sequential(&data, file.file_id())?;
    let valid_len = decoded
        .last()
        .map_or(0, |(_, offset, size)| offset + u64::from(*size));

    let entries = decoded
        .into_iter()
        .map(|(record, offset, size)| HintEntry {
            key: record.key,
            record_offset: offset,
            record_size: size,
            tombstone: record.tombstone,
        })
        .collect();

    Ok((entries, valid_len))
}

impl Engine {
    /// Opens (creating if absent) the store rooted at `dir`, replaying
    /// hint files — or scanning raw data files that lack one — to
    /// rebuild the key index, then starts the background merge
    /// scheduler unless disabled.
    pub fn open(dir: impl Into<PathBuf>, options: Options) -> Result<Self, Error> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;

        let discovered = discover_files(&dir)?;
        let index = KeyIndex::new();
        let stale = StaleAccountant::new(options.merge_threshold_per_file);
        let mut sealed_map = HashMap::new();
        let mut max_id = None;

        for file_id in &discovered.data_ids {
            max_id = Some(max_id.map_or(*file_id, |m: FileId| m.max(*file_id)));
            let file = SealedFile::open(&dir, *file_id)?;

            let (entries, valid_len) = if discovered.has_hint.contains_key(file_id) {
                (hint_file::read_entries(&data_file::hint_path(&dir, *file_id))?, file.size())
            } else {
                warn!(file_id = %file_id, "no hint file found, scanning data file directly");
                scan_data_file(&file)?
            };

            stale.register_file(*file_id, valid_len.min(file.size()));

            for entry in &entries {
                let locator = RecordLocator::new(*file_id, entry.record_offset, entry.record_size);
                if entry.tombstone {
                    if let Some(prior) = index.remove(&entry.key) {
                        stale.charge_overwrite(prior);
                    }
                    stale.charge_overwrite(locator);
                } else {
                    let prior = index.put(entry.key.clone(), locator)?;
                    if let Some(prior) = prior {
                        stale.charge_overwrite(prior);
                    }
                }
            }

            if !discovered.has_hint.contains_key(file_id) {
                let hint_path = data_file::hint_path(&dir, *file_id);
                let mut writer = HintWriter::create(&hint_path)?;
                for entry in &entries {
                    writer.append(&hint_path, entry)?;
                }
                writer.finish(&hint_path)?;
            }

            sealed_map.insert(*file_id, Arc::new(file));
        }

        let active_id = max_id.map_or(FileId::ZERO, FileId::next);
        // The file we just scanned raw (if any) is now fully sealed with
        // a hint; the new active file always starts empty.
        let active = ActiveFile::create(&dir, active_id)?;

        info!(
            dir = %dir.display(),
            recovered_files = sealed_map.len(),
            recovered_keys = index.len(),
            active_file = %active_id,
            "opened storage engine"
        );

        let shared = Arc::new(Shared {
            dir,
            options: options.clone(),
            index,
            stale,
            sealed: RwLock::new(Arc::new(sealed_map)),
            writer: Mutex::new(WriterState {
                active,
                pending_hints: Vec::new(),
            }),
            next_file_id: AtomicU32::new(active_id.as_u32() + 1),
        });

        let merge = if options.is_merge_disabled {
            None
        } else {
            Some(MergeScheduler::spawn(shared.clone()))
        };

        Ok(Self { shared, merge })
    }

    /// Looks up `key`, returning `None` if absent rather than an error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        check_key_len(key)?;
        match self.shared.read_current(key)? {
            Some(record) if !record.tombstone => Ok(Some(record.value)),
            _ => Ok(None),
        }
    }

    /// Inserts or overwrites `key`. Last writer wins.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        check_key_len(key)?;
        let bytes = Record::encode_put(key, value);
        let locator = self.append(key, bytes, false)?;

        if let Some(prior) = self.shared.index.put(Bytes::copy_from_slice(key), locator)? {
            self.shared.stale.charge_overwrite(prior);
        }
        Ok(())
    }

    /// Removes `key`. A no-op (but not an error) if it is already absent.
    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        check_key_len(key)?;
        let bytes = Record::encode_tombstone(key);
        let locator = self.append(key, bytes, true)?;
        // The tombstone record itself is dead the instant it's written.
        self.shared.stale.charge_overwrite(locator);

        if let Some(prior) = self.shared.index.remove(key) {
            self.shared.stale.charge_overwrite(prior);
        }
        Ok(())
    }

    fn append(&self, key: &[u8], bytes: Vec<u8>, tombstone: bool) -> Result<RecordLocator, Error> {
        let mut writer = self.shared.writer.lock().unwrap();
        if writer
            .active
            .would_exceed(bytes.len() as u64, self.shared.options.max_file_size)
        {
            self.rotate(&mut writer)?;
        }

        let offset = writer.active.append(&bytes)?;
        let record_size = bytes.len() as u32;
        writer.pending_hints.push(HintEntry {
            key: Bytes::copy_from_slice(key),
            record_offset: offset,
            record_size,
            tombstone,
        });

        Ok(RecordLocator::new(writer.active.file_id(), offset, record_size))
    }

    fn rotate(&self, writer: &mut WriterState) -> Result<(), Error> {
        let new_id = self.shared.alloc_file_id();
        let new_active = ActiveFile::create(&self.shared.dir, new_id)?;

        let old = std::mem::replace(
            writer,
            WriterState {
                active: new_active,
                pending_hints: Vec::new(),
            },
        );

        debug!(sealed_file = %old.active.file_id(), new_active = %new_id, "rolling over active file");
        seal_writer_state(&self.shared.dir, old, &self.shared)?;
        Ok(())
    }

    /// Returns the ids of every data file currently on disk, including
    /// the active one, oldest first.
    pub fn list_data_file_ids(&self) -> Vec<FileId> {
        let mut ids: Vec<FileId> = self.shared.sealed_snapshot().keys().copied().collect();
        ids.push(self.shared.writer.lock().unwrap().active.file_id());
        ids.sort();
        ids
    }

    /// Runs one merge pass synchronously, bypassing the scheduler's
    /// timer. Useful in tests and when merges are disabled.
    ///
    /// Uncancellable: it passes a stop flag that is never set, since
    /// there is no running scheduler thread to ask it to stop.
    pub fn merge_now(&self) -> Result<(), Error> {
        let stop = AtomicBool::new(false);
        crate::merge::run_merge_pass(&self.shared, &stop)
    }

    /// Exposes the shared engine state for whitebox merge tests in
    /// `merge.rs` that need to call `run_merge_pass` directly with a
    /// stop flag they control.
    #[cfg(test)]
    pub(crate) fn shared_for_test(&self) -> Arc<Shared> {
        self.shared.clone()
    }

    /// Stops the background merge thread, seals the active file
    /// (flushing and fsyncing it and its hint), closes every sealed
    /// file, and closes the index — the `close()` procedure of
    /// spec.md §4.6 point-for-point.
    pub fn close(mut self) -> Result<(), Error> {
        if let Some(merge) = self.merge.take() {
            merge.stop();
        }

        {
            let mut writer = self.shared.writer.lock().unwrap();
            if writer.active.write_offset() > 0 {
                let new_id = self.shared.alloc_file_id();
                let new_active = ActiveFile::create(&self.shared.dir, new_id)?;
                let old = std::mem::replace(
                    &mut *writer,
                    WriterState {
                        active: new_active,
                        pending_hints: Vec::new(),
                    },
                );
                seal_writer_state(&self.shared.dir, old, &self.shared)?;
            }
        }

        // "close all sealed files": replacing the published snapshot
        // with an empty one drops every `Arc<SealedFile>` this Engine
        // was holding, releasing their file descriptors.
        {
            let mut sealed = self.shared.sealed.write().unwrap();
            *sealed = Arc::new(HashMap::new());
        }

        // "close the index": documented operation, see `KeyIndex::close`.
        self.shared.index.close();

        Ok(())
    }
}

/// Writes the hint file for a retired [`WriterState`] in one pass from
/// its buffered entries, seals the underlying data file, and publishes
/// it into the shared sealed-file view.
fn seal_writer_state(dir: &Path, old: WriterState, shared: &Shared) -> Result<(), Error> {
    let hint_path = data_file::hint_path(dir, old.active.file_id());
    let mut hint = HintWriter::create(&hint_path)?;
    for entry in &old.pending_hints {
        hint.append(&hint_path, entry)?;
    }
    hint.finish(&hint_path)?;

    let sealed = old.active.seal()?;
    shared.insert_sealed(sealed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opts_no_merge() -> Options {
        Options::default().with_merge_disabled(true)
    }

    #[test]
    fn put_then_get_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();

        engine.put(b"k1", b"v1").unwrap();
        assert_eq!(engine.get(b"k1").unwrap().as_deref(), Some(&b"v1"[..]));
        assert_eq!(engine.get(b"missing").unwrap(), None);
    }

    #[test]
    fn last_writer_wins() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();

        engine.put(b"k", b"v1").unwrap();
        engine.put(b"k", b"v2").unwrap();
        assert_eq!(engine.get(b"k").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn delete_removes_key() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();

        engine.put(b"k", b"v").unwrap();
        engine.delete(b"k").unwrap();
        assert_eq!(engine.get(b"k").unwrap(), None);
    }

    #[test]
    fn delete_of_absent_key_is_not_an_error() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();
        engine.delete(b"never-existed").unwrap();
    }

    #[test]
    fn oversized_key_is_rejected_on_put_and_get() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();
        let key = vec![0u8; MAX_KEY_LEN + 1];

        assert!(matches!(
            engine.put(&key, b"v").unwrap_err(),
            Error::InvalidKey { .. }
        ));
        assert!(matches!(
            engine.get(&key).unwrap_err(),
            Error::InvalidKey { .. }
        ));
    }

    #[test]
    fn rollover_creates_multiple_data_files() {
        let dir = tempdir().unwrap();
        let options = opts_no_merge().with_max_file_size(128);
        let engine = Engine::open(dir.path(), options).unwrap();

        for i in 0..10u32 {
            let key = format!("key-{i:03}");
            engine.put(key.as_bytes(), &[b'x'; 20]).unwrap();
        }

        assert!(engine.list_data_file_ids().len() >= 3);
    }

    #[test]
    fn reopen_after_close_preserves_all_keys() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();
            for i in 0..50u32 {
                engine
                    .put(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                    .unwrap();
            }
            engine.delete(b"k3").unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();
        assert_eq!(engine.get(b"k3").unwrap(), None);
        for i in (0..50u32).filter(|&i| i != 3) {
            let expected = format!("v{i}");
            assert_eq!(
                engine.get(format!("k{i}").as_bytes()).unwrap().as_deref(),
                Some(expected.as_bytes())
            );
        }
    }

    #[test]
    fn reopen_after_crash_tolerates_torn_tail() {
        let dir = tempdir().unwrap();
        let active_path;
        {
            let options = opts_no_merge().with_max_file_size(1024);
            let engine = Engine::open(dir.path(), options).unwrap();
            engine.put(b"whole-one", b"value-one").unwrap();
            engine.put(b"whole-two", b"value-two").unwrap();
            active_path = engine.list_data_file_ids()[0];
            // No close(): simulate a crash, leaving the active file
            // and its hint unsealed on disk.
            std::mem::forget(engine);
        }

        let data_path = data_file::data_path(dir.path(), active_path);
        let mut bytes = std::fs::read(&data_path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&data_path, bytes).unwrap();
        std::fs::remove_file(data_file::hint_path(dir.path(), active_path)).ok();

        let engine = Engine::open(dir.path(), opts_no_merge()).unwrap();
        assert_eq!(
            engine.get(b"whole-one").unwrap().as_deref(),
            Some(&b"value-one"[..])
        );
    }
}
