//! Bulk extraction with bounded parallelism, resume and progress.

mod options;
mod path;
mod progress;
mod scheduler;
mod skip;

pub use options::{ExtractionOptions, DEFAULT_PROGRESS_INTERVAL, DEFAULT_STREAM_BUFFER};
pub use path::resolve_output;
pub use progress::{ExtractionProgress, NoProgress, ProgressSink};
pub use scheduler::{
    dump_cpk, CancellationToken, ExtractionFailure, ExtractionSummary, Extractor,
};
pub use skip::{NeverSkip, SizeMatch, SkipPolicy};
