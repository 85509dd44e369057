//! Archive key derivation.
//!
//! Encrypted archives are keyed by the CRC-32 of their own file name. When
//! the on-disk name differs from the one the game hashed (renamed copies,
//! case changes, stripped extensions) the key has to be found by trying a
//! short ordered list of candidates against the archive header.

use std::fmt;

use crifs_common::crc;

use crate::crypto::{self, CipherKey};
use crate::{Error, Result};

/// Number of leading bytes decrypted per candidate.
pub const PROBE_LEN: usize = 16;

/// Container magics recognized at the start of a decrypted header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownMagic {
    Cpk,
    Utf,
    Afs2,
    Crilayla,
}

impl KnownMagic {
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"CPK ") {
            Some(KnownMagic::Cpk)
        } else if bytes.starts_with(b"@UTF") {
            Some(KnownMagic::Utf)
        } else if bytes.starts_with(b"AFS2") {
            Some(KnownMagic::Afs2)
        } else if bytes.starts_with(b"CRILAYLA") {
            Some(KnownMagic::Crilayla)
        } else {
            None
        }
    }
}

/// Where a candidate key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    FileName,
    Complement,
    Lowercase,
    Extensionless,
    Alias(String),
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::FileName => f.write_str("file name"),
            KeySource::Complement => f.write_str("complemented file name"),
            KeySource::Lowercase => f.write_str("lowercase file name"),
            KeySource::Extensionless => f.write_str("extensionless file name"),
            KeySource::Alias(alias) => write!(f, "alias {alias:?}"),
        }
    }
}

/// One key to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCandidate {
    pub key: CipherKey,
    pub source: KeySource,
}

/// Primary key for an archive file name: the standard CRC-32 of its UTF-8
/// bytes, final complement included.
///
/// Some tools take the raw register instead, i.e. the same CRC without the
/// final complement. That value is `!derive_key(name)` and is always tried
/// as the [`KeySource::Complement`] candidate.
#[inline]
pub fn derive_key(file_name: &str) -> CipherKey {
    CipherKey::new(crc::hash_str(file_name))
}

/// Ordered, de-duplicated candidate keys for `file_name`.
///
/// Order: the name itself, its complemented CRC, the lowercase name, the name
/// without its extension, then each caller alias.
pub fn candidate_keys(file_name: &str, aliases: &[String]) -> Vec<KeyCandidate> {
    let primary = derive_key(file_name);
    let mut raw = vec![
        (primary, KeySource::FileName),
        (CipherKey::new(!primary.value()), KeySource::Complement),
        (derive_key(&file_name.to_lowercase()), KeySource::Lowercase),
    ];

    if let Some((stem, _)) = file_name.rsplit_once('.') {
        if !stem.is_empty() {
            raw.push((derive_key(stem), KeySource::Extensionless));
        }
    }

    for alias in aliases {
        raw.push((derive_key(alias), KeySource::Alias(alias.clone())));
    }

    let mut seen = hashbrown::HashSet::with_capacity(raw.len());
    raw.into_iter()
        .filter(|(key, _)| seen.insert(key.value()))
        .map(|(key, source)| KeyCandidate { key, source })
        .collect()
}

/// Find the key an archive header was encrypted with.
///
/// `header` is the first bytes of the archive, at least [`PROBE_LEN`] of them
/// when available. Returns `Ok(None)` for a plaintext archive. Only the probe
/// window is decrypted per candidate.
pub fn find_key(file_name: &str, header: &[u8], aliases: &[String]) -> Result<Option<CipherKey>> {
    match KnownMagic::detect(header) {
        Some(KnownMagic::Cpk) => return Ok(None),
        Some(_) => return Err(not_a_cpk(header)),
        None => {}
    }

    let probe = &header[..header.len().min(PROBE_LEN)];
    let candidates = candidate_keys(file_name, aliases);
    let mut scratch = [0u8; PROBE_LEN];

    for candidate in &candidates {
        let window = &mut scratch[..probe.len()];
        window.copy_from_slice(probe);
        crypto::apply_scalar(window, 0, &candidate.key.bytes());

        match KnownMagic::detect(window) {
            Some(KnownMagic::Cpk) => {
                tracing::debug!(
                    key = %candidate.key,
                    source = %candidate.source,
                    "derived archive key for {file_name}"
                );
                return Ok(Some(candidate.key));
            }
            Some(_) => return Err(not_a_cpk(window)),
            None => {
                tracing::trace!(key = %candidate.key, source = %candidate.source, "key rejected");
            }
        }
    }

    Err(Error::UnknownKey {
        file_name: file_name.to_string(),
        attempts: candidates.len(),
    })
}

/// Check an explicitly supplied key against the header.
pub fn verify_key(key: CipherKey, header: &[u8]) -> Result<()> {
    let mut window = header[..header.len().min(PROBE_LEN)].to_vec();
    crypto::apply_scalar(&mut window, 0, &key.bytes());
    match KnownMagic::detect(&window) {
        Some(KnownMagic::Cpk) => Ok(()),
        _ => Err(not_a_cpk(&window)),
    }
}

fn not_a_cpk(bytes: &[u8]) -> Error {
    Error::BadMagic {
        expected: "CPK ",
        actual: bytes[..bytes.len().min(4)].to_vec(),
    }
}
