//! Tunables for opening an [`crate::Engine`].

use std::time::Duration;

/// Configuration for [`crate::Engine::open`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Data files roll over to a new segment once the next append would
    /// push them past this size.
    pub max_file_size: u64,
    /// How often the background merge scheduler wakes up to check
    /// whether a merge pass is warranted.
    pub merge_job_interval: Duration,
    /// A sealed file becomes merge-eligible once
    /// `stale_bytes / total_bytes` reaches this ratio.
    pub merge_threshold_per_file: f64,
    /// A merge pass only runs once at least this many files are
    /// individually eligible.
    pub merge_threshold_file_number: usize,
    /// When set, the background merge scheduler is never started; stale
    /// space can still be reclaimed by calling `Engine::merge_now`.
    pub is_merge_disabled: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_file_size: 64 * 1024 * 1024,
            merge_job_interval: Duration::from_secs(30),
            merge_threshold_per_file: 0.5,
            merge_threshold_file_number: 4,
            is_merge_disabled: false,
        }
    }
}

impl Options {
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_merge_job_interval(mut self, interval: Duration) -> Self {
        self.merge_job_interval = interval;
        self
    }

    pub fn with_merge_threshold_per_file(mut self, ratio: f64) -> Self {
        self.merge_threshold_per_file = ratio;
        self
    }

    pub fn with_merge_threshold_file_number(mut self, count: usize) -> Self {
        self.merge_threshold_file_number = count;
        self
    }

    pub fn with_merge_disabled(mut self, disabled: bool) -> Self {
        self.is_merge_disabled = disabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let options = Options::default();
        assert_eq!(options.max_file_size, 64 * 1024 * 1024);
        assert_eq!(options.merge_job_interval, Duration::from_secs(30));
        assert!((options.merge_threshold_per_file - 0.5).abs() < f64::EPSILON);
        assert_eq!(options.merge_threshold_file_number, 4);
        assert!(!options.is_merge_disabled);
    }

    #[test]
    fn builder_methods_chain() {
        let options = Options::default()
            .with_max_file_size(1024)
            .with_merge_disabled(true);
        assert_eq!(options.max_file_size, 1024);
        assert!(options.is_merge_disabled);
    }
}
