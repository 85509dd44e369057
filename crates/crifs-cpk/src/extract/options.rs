//! Extraction configuration.

use std::time::Duration;

use crate::archive::DEFAULT_MMAP_THRESHOLD;

/// Default write buffer per worker.
pub const DEFAULT_STREAM_BUFFER: usize = 1024 * 1024;

/// Default minimum gap between progress reports.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Options for a bulk extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionOptions {
    /// Worker threads. Zero is treated as one.
    pub max_parallelism: usize,
    /// Archives at least this large are memory-mapped.
    pub mmap_threshold: u64,
    /// Write buffer size per output file.
    pub stream_buffer_size: usize,
    /// Consult the skip policy before extracting each entry.
    pub skip_existing: bool,
    /// Size output files to their final length before writing.
    pub preallocate: bool,
    /// Fail entries whose extracted length disagrees with the directory.
    pub verify_integrity: bool,
    pub progress_interval: Duration,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_parallelism: rayon::current_num_threads(),
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            stream_buffer_size: DEFAULT_STREAM_BUFFER,
            skip_existing: false,
            preallocate: false,
            verify_integrity: true,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

impl ExtractionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_parallelism(mut self, workers: usize) -> Self {
        self.max_parallelism = workers;
        self
    }

    pub fn with_mmap_threshold(mut self, threshold: u64) -> Self {
        self.mmap_threshold = threshold;
        self
    }

    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    pub fn with_skip_existing(mut self, skip: bool) -> Self {
        self.skip_existing = skip;
        self
    }

    pub fn with_preallocate(mut self, preallocate: bool) -> Self {
        self.preallocate = preallocate;
        self
    }

    pub fn with_verify_integrity(mut self, verify: bool) -> Self {
        self.verify_integrity = verify;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Effective worker count.
    #[inline]
    pub fn workers(&self) -> usize {
        self.max_parallelism.max(1)
    }
}
