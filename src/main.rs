//! Crifs CLI - Command-line tool for CRI CPK archives.
//!
//! This is the main entry point for the crifs command-line application.

mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use glob::{MatchOptions, Pattern};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use crifs::cpk::{crypto, decrypt_file, key};
use crifs::prelude::*;

use manifest::{DumpManifest, DEFAULT_MANIFEST_NAME};

/// Crifs - CRI CPK archive tool
#[derive(Parser)]
#[command(name = "crifs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Options for opening an archive.
#[derive(clap::Args)]
struct ArchiveArgs {
    /// Path to the CPK file
    #[arg(short, long, env = "CRIFS_INPUT")]
    input: PathBuf,

    /// Cipher key in hex (derived from the file name when omitted)
    #[arg(short, long, env = "CRIFS_KEY")]
    key: Option<CipherKey>,

    /// Extra names to derive candidate keys from (for renamed archives)
    #[arg(long = "alias")]
    aliases: Vec<String>,
}

impl ArchiveArgs {
    fn open_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.key = self.key;
        options.aliases = self.aliases.clone();
        options
    }

    fn open(&self, mmap_threshold: Option<u64>) -> Result<CpkArchive> {
        let mut options = self.open_options();
        if let Some(threshold) = mmap_threshold {
            options = options.with_mmap_threshold(threshold);
        }
        CpkArchive::open_with(&self.input, options).map_err(|e| open_failure(&self.input, e))
    }
}

/// Context for a failed open. Archive-level failures point at the key options.
fn open_failure(path: &Path, error: crifs::Error) -> anyhow::Error {
    let context = if error.is_archive_fatal() {
        format!(
            "{} is not a readable CPK archive (try --key or --alias if it was renamed)",
            path.display()
        )
    } else {
        format!("Failed to open CPK archive {}", path.display())
    };
    anyhow::Error::new(error).context(context)
}

#[derive(Subcommand)]
enum Commands {
    /// List contents of a CPK archive
    List {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Filter pattern (glob-style, case-insensitive)
        #[arg(short, long)]
        filter: Option<String>,

        /// Show sizes and offsets
        #[arg(short, long)]
        detailed: bool,

        /// Print the listing as JSON
        #[arg(long, conflicts_with = "detailed")]
        json: bool,
    },

    /// Extract files from a CPK archive
    Extract {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Output directory
        #[arg(short, long, env = "CRIFS_OUTPUT")]
        output: PathBuf,

        /// Filter pattern (glob-style, case-insensitive)
        #[arg(short, long)]
        filter: Option<String>,

        /// Worker threads (defaults to the number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Skip entries already present in the output
        #[arg(short, long)]
        resume: bool,

        /// Manifest used for resume (defaults to OUTPUT/.crifs-manifest.json)
        #[arg(long, requires = "resume")]
        manifest: Option<PathBuf>,

        /// Compare CRC-32 of existing files before skipping them
        #[arg(long, requires = "resume")]
        verify_hashes: bool,

        /// Do not check written sizes against the directory
        #[arg(long)]
        no_verify: bool,

        /// Preallocate output files before writing
        #[arg(long)]
        preallocate: bool,

        /// Archives at least this large are memory-mapped
        #[arg(long, value_name = "BYTES")]
        mmap_threshold: Option<u64>,
    },

    /// Decrypt a whole archive to a plaintext copy
    Decrypt {
        #[command(flatten)]
        archive: ArchiveArgs,

        /// Output file
        #[arg(short, long, env = "CRIFS_OUTPUT")]
        output: PathBuf,
    },

    /// Encrypt a plaintext archive (keyed by the output file name by default)
    Encrypt {
        /// Plaintext CPK file
        #[arg(short, long, env = "CRIFS_INPUT")]
        input: PathBuf,

        /// Output file
        #[arg(short, long, env = "CRIFS_OUTPUT")]
        output: PathBuf,

        /// Cipher key in hex
        #[arg(short, long, env = "CRIFS_KEY")]
        key: Option<CipherKey>,
    },

    /// Show the keys derived from archive names, or find the key of a file
    Key {
        /// Archive names to derive keys from
        names: Vec<String>,

        /// Probe this archive's header against its candidate keys
        #[arg(short, long)]
        probe: Option<PathBuf>,

        /// Extra names to try when probing
        #[arg(long = "alias")]
        aliases: Vec<String>,
    },
}

const TRANSCODE_BUFFER: usize = 4 * 1024 * 1024;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::List {
            archive,
            filter,
            detailed,
            json,
        } => {
            cmd_list(&archive, filter.as_deref(), detailed, json)?;
        }
        Commands::Extract {
            archive,
            output,
            filter,
            jobs,
            resume,
            manifest,
            verify_hashes,
            no_verify,
            preallocate,
            mmap_threshold,
        } => {
            let mut options = ExtractionOptions::default()
                .with_skip_existing(resume)
                .with_verify_integrity(!no_verify)
                .with_preallocate(preallocate);
            if let Some(jobs) = jobs {
                options = options.with_max_parallelism(jobs);
            }
            if let Some(threshold) = mmap_threshold {
                options = options.with_mmap_threshold(threshold);
            }
            let manifest = resume.then(|| manifest.unwrap_or_else(|| output.join(DEFAULT_MANIFEST_NAME)));
            cmd_extract(&archive, &output, filter.as_deref(), options, manifest, verify_hashes)?;
        }
        Commands::Decrypt { archive, output } => {
            cmd_decrypt(&archive, &output)?;
        }
        Commands::Encrypt { input, output, key } => {
            cmd_encrypt(&input, &output, key)?;
        }
        Commands::Key {
            names,
            probe,
            aliases,
        } => {
            cmd_key(&names, probe.as_deref(), &aliases)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_list(args: &ArchiveArgs, filter: Option<&str>, detailed: bool, json: bool) -> Result<()> {
    let archive = args.open(None)?;
    let matcher = EntryFilter::new(filter)?;
    let entries: Vec<CpkEntry> = archive
        .entries()
        .context("Failed to read CPK directory")?
        .iter()
        .filter(|e| matcher.matches(&e.relative_path()))
        .cloned()
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    for entry in &entries {
        if detailed {
            println!(
                "{:>#12x} {:>12} {:>12} {} {}",
                entry.file_offset,
                entry.file_size,
                entry.extract_size,
                if entry.is_compressed() { "C" } else { " " },
                entry.relative_path()
            );
        } else {
            println!("{}", entry.relative_path());
        }
    }

    println!("\nTotal: {} entries", entries.len());
    if let Some(key) = archive.key() {
        println!("Key: {key}");
    }

    Ok(())
}

fn cmd_extract(
    args: &ArchiveArgs,
    output: &Path,
    filter: Option<&str>,
    options: ExtractionOptions,
    manifest_path: Option<PathBuf>,
    verify_hashes: bool,
) -> Result<()> {
    let start = Instant::now();
    let archive = args.open(Some(options.mmap_threshold))?;
    let matcher = EntryFilter::new(filter)?;

    let entries: Vec<CpkEntry> = archive
        .entries()
        .context("Failed to read CPK directory")?
        .iter()
        .filter(|e| matcher.matches(&e.relative_path()))
        .cloned()
        .collect();

    println!(
        "Loaded {} entries in {:?}, extracting {}...",
        archive.entries()?.len(),
        start.elapsed(),
        entries.len()
    );

    let mut extractor = Extractor::new(&archive, options);
    let manifest = match manifest_path {
        Some(path) => {
            let manifest = Arc::new(
                DumpManifest::load(&path, archive.name())?.with_hash_check(verify_hashes),
            );
            println!("Resuming with {} recorded entries", manifest.len());
            extractor = extractor.with_skip_policy(manifest.clone());
            Some(manifest)
        }
        None => None,
    };

    let total_bytes = entries.iter().map(|e| e.extract_size).sum();
    let pb = ProgressBar::new(total_bytes);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {wide_msg}",
            )?
            .progress_chars("#>-"),
    );

    let sink = |progress: &ExtractionProgress| {
        pb.set_position(progress.bytes_done);
        if let Some(current) = &progress.current_file {
            pb.set_message(current.clone());
        }
    };

    let result = extractor.extract_entries(&entries, output, &sink);
    if let Some(manifest) = &manifest {
        manifest.save()?;
    }
    let summary = result.with_context(|| format!("Failed to extract into {}", output.display()))?;
    pb.finish_with_message("Done");

    println!(
        "Extracted {} files ({} bytes), skipped {}, failed {} in {:?}",
        summary.extracted, summary.bytes_written, summary.skipped, summary.failed, summary.elapsed
    );

    for failure in &summary.failures {
        eprintln!("  {}: {}", failure.path, failure.error);
    }
    if summary.failed > 0 {
        bail!("{} entries failed to extract", summary.failed);
    }

    Ok(())
}

fn cmd_decrypt(args: &ArchiveArgs, output: &Path) -> Result<()> {
    println!("Decrypting: {} -> {}", args.input.display(), output.display());

    match decrypt_file(&args.input, output, args.key, &args.aliases, TRANSCODE_BUFFER)
        .context("Failed to decrypt archive")?
    {
        Some(key) => println!("Decrypted with key {key}"),
        None => println!("Archive is not encrypted, nothing written"),
    }

    Ok(())
}

fn cmd_encrypt(input: &Path, output: &Path, key: Option<CipherKey>) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => {
            let name = output
                .file_name()
                .and_then(|n| n.to_str())
                .context("Output has no file name to derive a key from")?;
            key::derive_key(name)
        }
    };

    println!("Encrypting: {} -> {} with key {key}", input.display(), output.display());
    let bytes = crypto::transcode_file(input, output, key, TRANSCODE_BUFFER)
        .context("Failed to encrypt archive")?;
    println!("Wrote {bytes} bytes");

    Ok(())
}

fn cmd_key(names: &[String], probe: Option<&Path>, aliases: &[String]) -> Result<()> {
    for name in names {
        println!("{name}: {}", key::derive_key(name));
        for candidate in key::candidate_keys(name, aliases) {
            println!("  {:>12} {}", candidate.source.to_string(), candidate.key);
        }
    }

    if let Some(path) = probe {
        let archive = CpkArchive::open_with(
            path,
            OpenOptions {
                aliases: aliases.to_vec(),
                ..OpenOptions::default()
            },
        )
        .map_err(|e| open_failure(path, e))?;

        match archive.key() {
            Some(key) => println!("{}: {key}", path.display()),
            None => println!("{}: not encrypted", path.display()),
        }
    }

    if names.is_empty() && probe.is_none() {
        bail!("Give at least one archive name or --probe");
    }

    Ok(())
}

/// Case-insensitive entry filter.
///
/// Patterns with wildcards are globs over the whole path; plain text
/// matches anywhere in it.
struct EntryFilter {
    pattern: Option<Pattern>,
    needle: Option<String>,
}

impl EntryFilter {
    fn new(filter: Option<&str>) -> Result<Self> {
        let Some(filter) = filter else {
            return Ok(Self {
                pattern: None,
                needle: None,
            });
        };

        if filter.contains(['*', '?', '[']) {
            let pattern = Pattern::new(&filter.replace('\\', "/"))
                .with_context(|| format!("Invalid filter pattern {filter}"))?;
            Ok(Self {
                pattern: Some(pattern),
                needle: None,
            })
        } else {
            Ok(Self {
                pattern: None,
                needle: Some(filter.replace('\\', "/").to_lowercase()),
            })
        }
    }

    fn matches(&self, path: &str) -> bool {
        let path = path.replace('\\', "/");
        if let Some(pattern) = &self.pattern {
            let options = MatchOptions {
                case_sensitive: false,
                require_literal_separator: false,
                require_literal_leading_dot: false,
            };
            return pattern.matches_with(&path, options);
        }
        match &self.needle {
            Some(needle) => path.to_lowercase().contains(needle),
            None => true,
        }
    }
}
