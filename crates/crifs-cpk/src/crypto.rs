//! CRI XOR-CRC stream cipher.
//!
//! Encrypted CPK archives are XORed with a keystream derived from a 32-bit key
//! and the absolute file offset. Every 4-byte aligned block gets one keystream
//! word: the complemented block offset is pushed through four CRC-32 table
//! rounds (one per key byte), then complemented again. Each byte of the block
//! takes its XOR value from four 2-bit groups of that word.
//!
//! The transform is an involution, so the same functions encrypt and decrypt.
//! [`apply_scalar`] is the byte-at-a-time reference; [`apply`] processes whole
//! blocks as `u32` words and [`apply_parallel`] splits large buffers across the
//! rayon pool. All three produce identical output for any offset alignment.

use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use crifs_common::crc;
use rayon::prelude::*;

use crate::{Error, Result};

/// Buffers at least this large are decrypted on the rayon pool.
pub const PARALLEL_THRESHOLD: usize = 1024 * 1024;

/// Work unit for parallel decryption. Must stay a multiple of 4.
const PARALLEL_CHUNK: usize = 256 * 1024;

/// A 32-bit CRI cipher key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CipherKey(u32);

impl CipherKey {
    /// Wrap a raw key value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw key value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Key bytes in the order the keystream consumes them (least significant first).
    #[inline]
    pub const fn bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for CipherKey {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for CipherKey {
    type Err = std::num::ParseIntError;

    /// Parses hexadecimal, with or without a `0x` prefix.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u32::from_str_radix(digits, 16).map(Self)
    }
}

/// Keystream state for the 4-byte block starting at `block_offset`.
///
/// Only the low 32 bits of the offset seed the register.
#[inline]
pub fn keystream_word(block_offset: u64, key: &[u8; 4]) -> u32 {
    let register = key
        .iter()
        .fold(!(block_offset as u32), |register, &k| crc::update(register, k));
    !register
}

/// XOR byte for position `index` (0..4) within a keystream block.
#[inline]
pub fn xor_byte(word: u32, index: usize) -> u8 {
    let shift = (index as u32 & 3) * 2;
    let group = |bits: u32| (word >> (shift + bits)) & 3;
    ((group(0) << 6) | (group(8) << 4) | (group(16) << 2) | group(24)) as u8
}

/// All four XOR bytes of a block packed little-endian.
#[inline]
fn block_mask(block_offset: u64, key: &[u8; 4]) -> u32 {
    let word = keystream_word(block_offset, key);
    u32::from_le_bytes([
        xor_byte(word, 0),
        xor_byte(word, 1),
        xor_byte(word, 2),
        xor_byte(word, 3),
    ])
}

/// Reference implementation: one byte at a time.
pub fn apply_scalar(data: &mut [u8], offset: u64, key: &[u8; 4]) {
    let mut word = keystream_word(offset & !3, key);
    for (i, byte) in data.iter_mut().enumerate() {
        let pos = offset + i as u64;
        if pos & 3 == 0 {
            word = keystream_word(pos, key);
        }
        *byte ^= xor_byte(word, (pos & 3) as usize);
    }
}

/// Block-at-a-time implementation.
///
/// Unaligned leading and trailing bytes go through [`apply_scalar`].
pub fn apply(data: &mut [u8], offset: u64, key: &[u8; 4]) {
    let head = (((4 - (offset & 3)) & 3) as usize).min(data.len());
    let (head_bytes, body) = data.split_at_mut(head);
    apply_scalar(head_bytes, offset, key);

    let mut block = offset + head as u64;
    let mut chunks = body.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let value = LittleEndian::read_u32(chunk) ^ block_mask(block, key);
        LittleEndian::write_u32(chunk, value);
        block += 4;
    }
    apply_scalar(chunks.into_remainder(), block, key);
}

/// Split `data` into aligned chunks and run [`apply`] on the rayon pool.
pub fn apply_parallel(data: &mut [u8], offset: u64, key: &[u8; 4]) {
    let head = (((4 - (offset & 3)) & 3) as usize).min(data.len());
    let (head_bytes, body) = data.split_at_mut(head);
    apply_scalar(head_bytes, offset, key);

    let base = offset + head as u64;
    body.par_chunks_mut(PARALLEL_CHUNK)
        .enumerate()
        .for_each(|(i, chunk)| apply(chunk, base + (i * PARALLEL_CHUNK) as u64, key));
}

/// Pluggable in-place decryption hook.
///
/// `offset` is the absolute archive offset of `data[0]`. The keystream of every
/// cipher in this family depends on absolute position, so callers must never
/// pass an entry-relative offset.
pub trait Decryptor: Send + Sync {
    /// Decrypt `data` in place.
    fn decrypt(&self, offset: u64, data: &mut [u8]);
}

impl<F> Decryptor for F
where
    F: Fn(u64, &mut [u8]) + Send + Sync,
{
    fn decrypt(&self, offset: u64, data: &mut [u8]) {
        self(offset, data)
    }
}

/// The CRI XOR-CRC cipher bound to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriCipher {
    key: CipherKey,
    bytes: [u8; 4],
}

impl CriCipher {
    /// Create a cipher for `key`.
    pub const fn new(key: CipherKey) -> Self {
        Self {
            key,
            bytes: key.bytes(),
        }
    }

    /// The key this cipher was built from.
    #[inline]
    pub fn key(&self) -> CipherKey {
        self.key
    }

    /// Apply the keystream to `data` located at `offset`.
    pub fn apply(&self, offset: u64, data: &mut [u8]) {
        if data.len() >= PARALLEL_THRESHOLD {
            apply_parallel(data, offset, &self.bytes);
        } else {
            apply(data, offset, &self.bytes);
        }
    }
}

impl Decryptor for CriCipher {
    fn decrypt(&self, offset: u64, data: &mut [u8]) {
        self.apply(offset, data);
    }
}

/// Stream a whole file through the cipher.
///
/// Works for both directions. Returns the number of bytes processed.
pub fn transcode_file(
    input: &Path,
    output: &Path,
    key: CipherKey,
    buffer_size: usize,
) -> Result<u64> {
    let cipher = CriCipher::new(key);
    let mut reader = File::open(input).map_err(|e| Error::io(input, e))?;
    let mut writer = File::create(output).map_err(|e| Error::io(output, e))?;

    let mut buffer = vec![0u8; buffer_size.max(4)];
    let mut offset = 0u64;

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| Error::io(input, e))?;
        if read == 0 {
            break;
        }

        cipher.apply(offset, &mut buffer[..read]);
        writer
            .write_all(&buffer[..read])
            .map_err(|e| Error::io(output, e))?;
        offset += read as u64;
    }

    writer.flush().map_err(|e| Error::io(output, e))?;
    tracing::debug!(bytes = offset, key = %key, "transcoded {}", input.display());
    Ok(offset)
}
