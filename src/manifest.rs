//! Dump manifest: the record of what a previous run already extracted.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use crifs::prelude::*;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// File name used when no manifest path is given.
pub const DEFAULT_MANIFEST_NAME: &str = ".crifs-manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub size: u64,
    pub crc32: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ManifestFile {
    archive: String,
    entries: BTreeMap<String, ManifestRecord>,
}

/// Resume state for one archive, shared with the extraction workers.
#[derive(Debug)]
pub struct DumpManifest {
    path: PathBuf,
    archive: String,
    verify_hashes: bool,
    records: Mutex<HashMap<String, ManifestRecord>>,
}

impl DumpManifest {
    /// Load `path`, or start empty when it is missing or belongs to another archive.
    pub fn load(path: &Path, archive: &str) -> Result<Self> {
        let mut records = HashMap::new();

        if path.exists() {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read manifest {}", path.display()))?;
            let file: ManifestFile = serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse manifest {}", path.display()))?;

            if file.archive.eq_ignore_ascii_case(archive) {
                records.extend(file.entries);
            } else {
                tracing::warn!(
                    manifest = %file.archive,
                    archive,
                    "manifest belongs to another archive, starting fresh"
                );
            }
        }

        tracing::debug!(entries = records.len(), "loaded manifest {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            archive: archive.to_string(),
            verify_hashes: false,
            records: Mutex::new(records),
        })
    }

    /// Also compare CRC-32 before skipping. Reads every candidate back.
    pub fn with_hash_check(mut self, verify: bool) -> Self {
        self.verify_hashes = verify;
        self
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Persist the manifest, writing a temporary file first.
    pub fn save(&self) -> Result<()> {
        let file = ManifestFile {
            archive: self.archive.clone(),
            entries: self
                .records
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        };

        let json = serde_json::to_string_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        tracing::debug!(entries = file.entries.len(), "saved manifest {}", self.path.display());
        Ok(())
    }
}

impl SkipPolicy for DumpManifest {
    /// Entries the manifest never saw, e.g. because an earlier run stopped
    /// before saving it, fall back to the size check.
    fn should_skip(&self, relative: &str, target: &Path, entry: &CpkEntry) -> bool {
        let Some(record) = self.records.lock().get(relative).copied() else {
            return SizeMatch.should_skip(relative, target, entry);
        };

        match fs::metadata(target) {
            Ok(meta) if meta.is_file() && meta.len() == record.size => {
                !self.verify_hashes || file_crc32(target).ok() == Some(record.crc32)
            }
            _ => false,
        }
    }

    fn record_extracted(&self, relative: &str, _target: &Path, _entry: &CpkEntry, data: &[u8]) {
        let record = ManifestRecord {
            size: data.len() as u64,
            crc32: crc32fast::hash(data),
        };
        self.records.lock().insert(relative.to_string(), record);
    }
}

fn file_crc32(path: &Path) -> std::io::Result<u32> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}
