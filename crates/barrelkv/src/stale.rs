//! Stale-byte accounting and victim election for background merges.
//!
//! Every sealed file registers its total size once. Each time one of its
//! records is superseded, `charge_overwrite` adds the record's size to
//! that file's counter; once the counter crosses `threshold_per_file *
//! file_size`, the file is moved into the victim set and its counter
//! resets. The merge scheduler only ever asks for a batch of ids already
//! in that set — it never inspects file contents itself.

use dashmap::{DashMap, DashSet};

use crate::locator::{FileId, RecordLocator};

/// Per-file live/stale byte bookkeeping and victim-set membership.
pub struct StaleAccountant {
    threshold_per_file: f64,
    total_bytes: DashMap<FileId, u64>,
    stale_bytes: DashMap<FileId, u64>,
    victims: DashSet<FileId>,
}

impl StaleAccountant {
    pub fn new(threshold_per_file: f64) -> Self {
        Self {
            threshold_per_file,
            total_bytes: DashMap::new(),
            stale_bytes: DashMap::new(),
            victims: DashSet::new(),
        }
    }

    /// Registers a newly sealed file with its total size. Must be called
    /// exactly once per file, before any `charge_overwrite` against it.
    pub fn register_file(&self, file_id: FileId, total_size: u64) {
        self.total_bytes.insert(file_id, total_size);
        self.stale_bytes.entry(file_id).or_insert(0);
    }

    /// Adds `prior.record_size` to `prior.file_id`'s stale counter. Once
    /// the running total reaches `threshold_per_file * file_size`, the
    /// file enters the victim set and its counter resets to zero.
    pub fn charge_overwrite(&self, prior: RecordLocator) {
        let mut entry = self.stale_bytes.entry(prior.file_id).or_insert(0);
        *entry += u64::from(prior.record_size);
        let total = *entry;

        let size = self.total_bytes.get(&prior.file_id).map_or(0, |v| *v);
        if size > 0 && total as f64 >= self.threshold_per_file * size as f64 {
            *entry = 0;
            drop(entry);
            self.victims.insert(prior.file_id);
        }
    }

    pub fn victim_count(&self) -> usize {
        self.victims.len()
    }

    /// Returns up to `n` file ids already in the victim set. Election
    /// order within the set is unspecified.
    pub fn elect_batch(&self, n: usize) -> Vec<FileId> {
        self.victims.iter().take(n).map(|r| *r).collect()
    }

    /// Removes `ids` from the victim set once the merger has rewritten
    /// them, without forgetting their size bookkeeping (the file itself
    /// isn't deleted until `drop_file`).
    pub fn retire(&self, ids: &[FileId]) {
        for id in ids {
            self.victims.remove(id);
        }
    }

    /// Called when a file is deleted from disk: drops its counter, size,
    /// and any victim-set membership.
    pub fn drop_file(&self, file_id: FileId) {
        self.victims.remove(&file_id);
        self.stale_bytes.remove(&file_id);
        self.total_bytes.remove(&file_id);
    }

    #[cfg(test)]
    fn stale_bytes(&self, file_id: FileId) -> u64 {
        self.stale_bytes.get(&file_id).map_or(0, |v| *v)
    }
}
