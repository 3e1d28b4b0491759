//! Background compaction: rewrites the live records out of stale,
//! sealed files into fresh ones, then deletes the originals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::data_file::{self, ActiveFile, SealedFile};
use crate::engine::Shared;
use crate::error::Error;
use crate::hint_file::{HintEntry, HintWriter};
use crate::locator::{FileId, RecordLocator};
use crate::record::Record;

/// Owns the background merge thread. Dropping a `MergeScheduler`
/// without calling `stop` leaves the thread running detached; `Engine`
/// always calls `stop` from `close`.
pub(crate) struct MergeScheduler {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MergeScheduler {
    pub(crate) fn spawn(shared: Arc<Shared>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("barrelkv-merge".into())
            .spawn(move || merge_loop(&shared, &thread_stop))
            .expect("failed to spawn merge thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn merge_loop(shared: &Arc<Shared>, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let interval = shared.options.merge_job_interval;
        // Sleep in short slices so `stop` is noticed promptly rather
        // than only once per full interval.
        let slices: u32 = 10;
        for _ in 0..slices {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            std::thread::sleep(interval / slices);
        }

        if let Err(err) = run_merge_pass(shared, stop) {
            warn!(error = %err, "merge pass failed");
        }
    }
}

/// Runs a single merge pass: elects eligible files, rewrites their live
/// records into a fresh data/hint pair, publishes the new file, then
/// deletes the victims. A no-op when nothing is eligible.
///
/// `stop` is polled between records (spec.md §5 "Cancellation"): a
/// victim is only retired and deleted once every one of its records has
/// been considered, so a stop request simply shrinks the batch that
/// gets retired rather than corrupting anything in flight. Pass an
/// `AtomicBool` that is never set (e.g. a fresh one) for an
/// uncancellable pass, as `Engine::merge_now` does.
pub(crate) fn run_merge_pass(shared: &Arc<Shared>, stop: &AtomicBool) -> Result<(), Error> {
    if shared.stale.victim_count() < shared.options.merge_threshold_file_number {
        return Ok(());
    }
    let victims = shared.stale.elect_batch(shared.options.merge_threshold_file_number);
    if victims.is_empty() {
        return Ok(());
    }

    debug!(victims = ?victims, "starting merge pass");
    let sealed = shared.sealed_snapshot();
    let merged_id = shared.alloc_file_id();
    let mut active = ActiveFile::create(&shared.dir, merged_id)?;
    let hint_path = data_file::hint_path(&shared.dir, merged_id);
    let mut hint_writer = HintWriter::create(&hint_path)?;

    let mut wrote_any = false;
    let mut completed: Vec<FileId> = Vec::new();

    for victim_id in &victims {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let Some(victim) = sealed.get(victim_id) else {
            completed.push(*victim_id);
            continue;
        };
        let finished = rewrite_live_records(
            shared,
            victim,
            &mut active,
            &mut hint_writer,
            &hint_path,
            &mut wrote_any,
            stop,
        )?;
        if finished {
            completed.push(*victim_id);
        } else {
            // Stopped partway through this victim: it still has live
            // records we never got to, so it cannot be retired.
            break;
        }
    }

    hint_writer.finish(&hint_path)?;

    if completed.is_empty() {
        // Stopped before any victim was fully considered; discard
        // whatever partial output exists and leave the victim set
        // untouched for the next pass to retry.
        drop(active);
        std::fs::remove_file(data_file::data_path(&shared.dir, merged_id)).ok();
        std::fs::remove_file(&hint_path).ok();
        return Ok(());
    }

    if !wrote_any {
        // Every record in every completed victim was already overwritten
        // elsewhere by the time we got here; drop the empty output file.
        drop(active);
        std::fs::remove_file(data_file::data_path(&shared.dir, merged_id)).ok();
        std::fs::remove_file(&hint_path).ok();
        shared.stale.retire(&completed);
        shared.swap_sealed(&completed, Vec::new());
        for id in &completed {
            if let Some(file) = sealed.get(id) {
                file.delete()?;
            }
        }
        info!(victims = ?completed, "merge pass reclaimed fully-stale files with no live data");
        return Ok(());
    }

    let merged = active.seal()?;
    shared.stale.retire(&completed);
    shared.swap_sealed(&completed, vec![merged]);

    for id in &completed {
        if let Some(file) = sealed.get(id) {
            file.delete()?;
        }
    }

    info!(victims = ?completed, merged_into = %merged_id, "merge pass complete");
    Ok(())
}

/// Scans `victim` record by record. For each still-live key (the index
/// still points at this exact locator), copies it into the merge output
/// and CAS-replaces the index entry to point at the new location. A
/// concurrent write or delete on the same key simply fails the CAS,
/// leaving the fresher value untouched.
///
/// Checks `stop` before each record so a cancellation request is
/// noticed within one record's worth of I/O rather than waiting for the
/// whole victim. Returns `true` if every record in `victim` was
/// considered, `false` if `stop` cut the scan short.
fn rewrite_live_records(
    shared: &Arc<Shared>,
    victim: &Arc<SealedFile>,
    active: &mut ActiveFile,
    hint_writer: &mut HintWriter,
    hint_path: &std::path::Path,
    wrote_any: &mut bool,
    stop: &AtomicBool,
) -> Result<bool, Error> {
    let data = victim.read_all()?;
    let decoded = crate::record::decode_sequential(&data, victim.file_id())?;

    for (record, old_offset, record_size) in decoded {
        if stop.load(Ordering::Relaxed) {
            return Ok(false);
        }

        if record.tombstone {
            continue;
        }

        let old_locator = RecordLocator::new(victim.file_id(), old_offset, record_size);
        if shared.index.get(&record.key) != Some(old_locator) {
            // Already superseded; its bytes here are already stale.
            continue;
        }

        let record_bytes = data.slice(old_offset as usize..old_offset as usize + record_size as usize);
        let new_offset = active.append(&record_bytes)?;
        let new_locator = RecordLocator::new(active.file_id(), new_offset, record_size);
        hint_writer.append(
            hint_path,
            &HintEntry {
                key: record.key.clone(),
                record_offset: new_offset,
                record_size,
                tombstone: false,
            },
        )?;
        *wrote_any = true;

        if !shared.index.replace(&record.key, old_locator, new_locator) {
            // Lost the race: the key was written again between our read
            // and our CAS. The copy we just wrote is now itself stale.
            shared.stale.charge_overwrite(new_locator);
        }
    }

    Ok(true)
}
