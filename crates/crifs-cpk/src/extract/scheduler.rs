//! Parallel bulk extraction.
//!
//! One producer (the calling thread) walks the listing and feeds a bounded
//! channel; `N` scoped workers read, verify and write entries. Per-entry
//! failures are recorded and never stop sibling work.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use hashbrown::HashSet;
use parking_lot::Mutex;

use super::options::ExtractionOptions;
use super::path::resolve_output;
use super::progress::{ExtractionProgress, ProgressSink, ProgressTracker};
use super::skip::{SizeMatch, SkipPolicy};
use crate::archive::{CpkArchive, OpenOptions, ReadBuffers};
use crate::entry::CpkEntry;
use crate::{Error, Result};

/// Cooperative cancellation flag shared between a caller and an extraction.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. In-flight entries still finish.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One entry that could not be extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExtractionFailure {
    pub path: String,
    pub error: String,
}

/// Outcome of a bulk extraction.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExtractionSummary {
    pub total: u64,
    pub extracted: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_written: u64,
    pub cancelled: bool,
    pub failures: Vec<ExtractionFailure>,
    pub elapsed: Duration,
}

impl ExtractionSummary {
    /// Finished without failures or cancellation.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Entries that were handled in any way.
    pub fn processed(&self) -> u64 {
        self.extracted + self.skipped + self.failed
    }
}

struct Job<'e> {
    entry: &'e CpkEntry,
    relative: String,
    target: PathBuf,
}

enum Outcome {
    Extracted(u64),
    Skipped,
}

#[derive(Default)]
struct Counters {
    extracted: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    bytes_written: AtomicU64,
    failures: Mutex<Vec<ExtractionFailure>>,
}

impl Counters {
    fn fail(&self, path: String, error: &Error) {
        tracing::warn!(path = %path, "extraction failed: {error}");
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.failures.lock().push(ExtractionFailure {
            path,
            error: error.to_string(),
        });
    }
}

/// Bulk extractor bound to one open archive.
pub struct Extractor<'a> {
    archive: &'a CpkArchive,
    options: ExtractionOptions,
    skip: Arc<dyn SkipPolicy>,
    cancel: CancellationToken,
}

impl<'a> Extractor<'a> {
    pub fn new(archive: &'a CpkArchive, options: ExtractionOptions) -> Self {
        Self {
            archive,
            options,
            skip: Arc::new(SizeMatch),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the default size-match resume check.
    pub fn with_skip_policy(mut self, policy: Arc<dyn SkipPolicy>) -> Self {
        self.skip = policy;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    /// Extract every entry of the archive under `output`.
    pub fn extract_all(&self, output: &Path, sink: &dyn ProgressSink) -> Result<ExtractionSummary> {
        let entries = self.archive.entries()?;
        self.extract_entries(&entries, output, sink)
    }

    /// Extract `entries` under `output`.
    ///
    /// Only failures to create `output` itself are returned as errors;
    /// everything else is reported in the summary.
    pub fn extract_entries(
        &self,
        entries: &[CpkEntry],
        output: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<ExtractionSummary> {
        let start = Instant::now();
        fs::create_dir_all(output).map_err(|e| Error::io(output, e))?;

        let bytes_total = entries.iter().map(|e| e.extract_size).sum();
        let tracker = ProgressTracker::new(
            entries.len() as u64,
            bytes_total,
            self.options.progress_interval,
            sink,
        );
        let counters = Counters::default();

        let jobs = self.plan(entries, output, &counters, &tracker);
        create_parents(&jobs);

        let workers = self.options.workers().min(jobs.len().max(1));
        tracing::info!(
            archive = %self.archive.name(),
            entries = entries.len(),
            workers,
            "extracting to {}",
            output.display()
        );

        let (tx, rx) = bounded::<Job<'_>>(workers * 2);

        thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let counters = &counters;
                let tracker = &tracker;
                s.spawn(move || {
                    let mut buffers = ReadBuffers::new();
                    for job in rx.iter() {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        match self.process(&job, &mut buffers) {
                            Ok(Outcome::Extracted(written)) => {
                                counters.extracted.fetch_add(1, Ordering::Relaxed);
                                counters.bytes_written.fetch_add(written, Ordering::Relaxed);
                            }
                            Ok(Outcome::Skipped) => {
                                counters.skipped.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => counters.fail(job.relative.clone(), &e),
                        }
                        tracker.record(job.entry.extract_size, &job.relative);
                    }
                });
            }
            drop(rx);

            for job in jobs {
                if self.cancel.is_cancelled() {
                    break;
                }
                if tx.send(job).is_err() {
                    break;
                }
            }
            drop(tx);
        });

        let last: ExtractionProgress = tracker.finish();
        let cancelled = self.cancel.is_cancelled() && last.files_done < last.files_total;

        let summary = ExtractionSummary {
            total: entries.len() as u64,
            extracted: counters.extracted.load(Ordering::Acquire),
            skipped: counters.skipped.load(Ordering::Acquire),
            failed: counters.failed.load(Ordering::Acquire),
            bytes_written: counters.bytes_written.load(Ordering::Acquire),
            cancelled,
            failures: counters.failures.into_inner(),
            elapsed: start.elapsed(),
        };

        tracing::info!(
            extracted = summary.extracted,
            skipped = summary.skipped,
            failed = summary.failed,
            bytes = summary.bytes_written,
            cancelled = summary.cancelled,
            "extraction finished in {:.2?}",
            summary.elapsed
        );
        Ok(summary)
    }

    /// Resolve output paths, recording rejected entries as failures.
    ///
    /// Each output path gets at most one job. Later entries that resolve to
    /// an already claimed path fail with [`Error::DuplicateOutput`].
    fn plan<'e>(
        &self,
        entries: &'e [CpkEntry],
        output: &Path,
        counters: &Counters,
        tracker: &ProgressTracker<'_>,
    ) -> Vec<Job<'e>> {
        let mut jobs = Vec::with_capacity(entries.len());
        let mut claimed: HashSet<PathBuf> = HashSet::with_capacity(entries.len());

        for entry in entries {
            let relative = entry.relative_path();
            let planned = resolve_output(output, entry).and_then(|target| {
                if claimed.insert(collision_key(&target)) {
                    Ok(target)
                } else {
                    Err(Error::DuplicateOutput(relative.clone()))
                }
            });

            match planned {
                Ok(target) => jobs.push(Job {
                    entry,
                    relative,
                    target,
                }),
                Err(e) => {
                    counters.fail(relative.clone(), &e);
                    tracker.record(entry.extract_size, &relative);
                }
            }
        }

        jobs
    }

    fn process(&self, job: &Job<'_>, buffers: &mut ReadBuffers) -> Result<Outcome> {
        let entry = job.entry;

        if self.options.skip_existing && self.skip.should_skip(&job.relative, &job.target, entry) {
            tracing::trace!(path = %job.relative, "skipped existing");
            return Ok(Outcome::Skipped);
        }

        let extracted = self.archive.read_with(entry, buffers)?;
        let written = extracted.len() as u64;

        if self.options.verify_integrity {
            let expected = if extracted.decompressed {
                entry.extract_size
            } else {
                entry.file_size
            };
            if written != expected {
                return Err(Error::IntegrityMismatch {
                    name: job.relative.clone(),
                    expected,
                    actual: written,
                });
            }
        }

        write_atomically(
            &job.target,
            &extracted.data,
            self.options.stream_buffer_size,
            self.options.preallocate,
        )?;
        self.skip
            .record_extracted(&job.relative, &job.target, entry, &extracted.data);

        Ok(Outcome::Extracted(written))
    }
}

/// Create every distinct parent directory once.
fn create_parents(jobs: &[Job<'_>]) {
    let parents: HashSet<&Path> = jobs.iter().filter_map(|j| j.target.parent()).collect();
    for dir in parents {
        // A failure here surfaces again, per entry, when the file is created.
        if let Err(e) = fs::create_dir_all(dir) {
            tracing::warn!("cannot create {}: {e}", dir.display());
        }
    }
}

/// Key under which two output paths name the same file on this host.
fn collision_key(target: &Path) -> PathBuf {
    if cfg!(any(windows, target_os = "macos")) {
        PathBuf::from(target.to_string_lossy().to_lowercase())
    } else {
        target.to_path_buf()
    }
}

/// Write to a uniquely named `.part` file beside `target`, then rename it
/// over `target`. The part file is removed on any failure.
fn write_atomically(target: &Path, data: &[u8], buffer_size: usize, preallocate: bool) -> Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let io_err = |e: std::io::Error| Error::io(target, e);

    let part = tempfile::Builder::new()
        .prefix(".crifs-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(io_err)?;
    if preallocate {
        part.as_file().set_len(data.len() as u64).map_err(io_err)?;
    }

    let mut writer = BufWriter::with_capacity(buffer_size.max(4096), part);
    writer.write_all(data).map_err(io_err)?;
    let part = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
    part.persist(target).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Open `path` and extract everything under `output`.
pub fn dump_cpk(
    path: &Path,
    output: &Path,
    options: ExtractionOptions,
    sink: &dyn ProgressSink,
) -> Result<ExtractionSummary> {
    let archive = CpkArchive::open_with(
        path,
        OpenOptions::default().with_mmap_threshold(options.mmap_threshold),
    )?;
    Extractor::new(&archive, options).extract_all(output, sink)
}
