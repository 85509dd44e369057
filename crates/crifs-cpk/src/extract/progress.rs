//! Progress snapshots and sinks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

/// A point-in-time view of a bulk extraction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExtractionProgress {
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    /// Entry whose completion triggered this snapshot.
    pub current_file: Option<String>,
    pub elapsed: Duration,
}

impl ExtractionProgress {
    /// Completion in percent, by bytes when known, otherwise by files.
    pub fn percent(&self) -> f64 {
        if self.bytes_total > 0 {
            self.bytes_done as f64 * 100.0 / self.bytes_total as f64
        } else if self.files_total > 0 {
            self.files_done as f64 * 100.0 / self.files_total as f64
        } else {
            100.0
        }
    }

    /// Bytes per second so far.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_done as f64 / secs
        } else {
            0.0
        }
    }

    /// Linear estimate of the remaining time.
    pub fn eta(&self) -> Option<Duration> {
        let fraction = self.percent() / 100.0;
        if fraction <= 0.0 {
            return None;
        }
        let total = self.elapsed.as_secs_f64() / fraction;
        Some(Duration::from_secs_f64((total - self.elapsed.as_secs_f64()).max(0.0)))
    }

    pub fn is_complete(&self) -> bool {
        self.files_done >= self.files_total
    }
}

/// Receiver of progress snapshots.
///
/// Successive snapshots never go backwards, and the last one of a run that
/// was not cancelled carries the full totals.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: &ExtractionProgress);
}

impl<F> ProgressSink for F
where
    F: Fn(&ExtractionProgress) + Send + Sync,
{
    fn report(&self, progress: &ExtractionProgress) {
        self(progress)
    }
}

impl ProgressSink for Sender<ExtractionProgress> {
    fn report(&self, progress: &ExtractionProgress) {
        // A dropped receiver just stops listening.
        let _ = self.send(progress.clone());
    }
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _progress: &ExtractionProgress) {}
}

/// Shared counters behind the snapshots.
pub(crate) struct ProgressTracker<'s> {
    files_total: u64,
    bytes_total: u64,
    files_done: AtomicU64,
    bytes_done: AtomicU64,
    start: Instant,
    interval: Duration,
    last_emit: Mutex<Option<Instant>>,
    sink: &'s dyn ProgressSink,
}

impl<'s> ProgressTracker<'s> {
    pub(crate) fn new(
        files_total: u64,
        bytes_total: u64,
        interval: Duration,
        sink: &'s dyn ProgressSink,
    ) -> Self {
        Self {
            files_total,
            bytes_total,
            files_done: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            start: Instant::now(),
            interval,
            last_emit: Mutex::new(None),
            sink,
        }
    }

    /// Count one finished entry and report if the throttle allows.
    pub(crate) fn record(&self, bytes: u64, current: &str) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);

        // Skip the report if another worker is emitting right now.
        let Some(mut last) = self.last_emit.try_lock() else {
            return;
        };
        let now = Instant::now();
        if last.is_some_and(|t| now.duration_since(t) < self.interval) {
            return;
        }
        *last = Some(now);
        // Counters are read under the lock so reports stay ordered.
        let snapshot = self.snapshot(Some(current.to_string()));
        self.sink.report(&snapshot);
    }

    /// Emit the closing snapshot.
    pub(crate) fn finish(&self) -> ExtractionProgress {
        let mut last = self.last_emit.lock();
        *last = Some(Instant::now());
        let snapshot = self.snapshot(None);
        self.sink.report(&snapshot);
        snapshot
    }

    fn snapshot(&self, current_file: Option<String>) -> ExtractionProgress {
        ExtractionProgress {
            files_done: self.files_done.load(Ordering::Acquire),
            files_total: self.files_total,
            bytes_done: self.bytes_done.load(Ordering::Acquire),
            bytes_total: self.bytes_total,
            current_file,
            elapsed: self.start.elapsed(),
        }
    }
}
