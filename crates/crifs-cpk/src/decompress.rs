//! CRILAYLA compression.
//!
//! Layout of a compressed payload:
//!
//! ```text
//! 0x00  "CRILAYLA"
//! 0x08  u32 LE  body size (decompressed, excluding the raw prefix)
//! 0x0C  u32 LE  bitstream length
//! 0x10  bitstream
//! ....  0x100 raw bytes, copied verbatim to the start of the output
//! ```
//!
//! The bitstream is consumed from its last byte towards its first, most
//! significant bit first, and the body is produced from its last byte towards
//! its first. Each token is either a literal (`0` + 8 bits) or a
//! back-reference (`1` + 13-bit distance + variable-length count) copying
//! from bytes already written above the cursor.

use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;

use crate::{Error, Result};

/// Payload magic.
pub const MAGIC: &[u8; 8] = b"CRILAYLA";

/// Size of the fixed header before the bitstream.
pub const HEADER_LEN: usize = 0x10;

/// Uncompressed bytes stored after the bitstream.
pub const PREFIX_LEN: usize = 0x100;

const DISTANCE_BITS: u32 = 13;
const MIN_DISTANCE: usize = 3;
const MAX_DISTANCE: usize = (1 << DISTANCE_BITS) - 1 + MIN_DISTANCE;
const MIN_MATCH: usize = 3;

/// Upper bound on body bytes one bitstream bit can produce. The densest
/// token is a back-reference extended by 0xFF length chunks, just under 32.
const MAX_BYTES_PER_BIT: usize = 32;

/// Bit widths of the back-reference length levels. A level that reads all
/// ones continues into the next; past the last level, 8-bit chunks repeat
/// while they read 0xFF.
const LENGTH_LEVELS: [u32; 4] = [2, 3, 5, 8];

/// Check whether a payload starts with the CRILAYLA magic.
#[inline]
pub fn is_compressed(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Output size announced by a CRILAYLA header, prefix included.
pub fn decompressed_size(data: &[u8]) -> Option<usize> {
    if data.len() < HEADER_LEN || !is_compressed(data) {
        return None;
    }
    Some(PREFIX_LEN + LittleEndian::read_u32(&data[8..12]) as usize)
}

/// Decompress a CRILAYLA payload.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    decompress_into(data, &mut output)?;
    Ok(output)
}

/// Decompress into a reusable buffer. `output` is cleared first.
pub fn decompress_into(data: &[u8], output: &mut Vec<u8>) -> Result<()> {
    if data.len() < HEADER_LEN {
        return Err(Error::Truncated {
            what: "CRILAYLA header",
            needed: HEADER_LEN as u64,
            available: data.len() as u64,
        });
    }
    if !is_compressed(data) {
        return Err(Error::BadMagic {
            expected: "CRILAYLA",
            actual: data[..8].to_vec(),
        });
    }

    let body_len = LittleEndian::read_u32(&data[8..12]) as usize;
    let stream_len = LittleEndian::read_u32(&data[12..16]) as usize;

    let prefix_start = HEADER_LEN + stream_len;
    let prefix = data
        .get(prefix_start..prefix_start + PREFIX_LEN)
        .ok_or_else(|| {
            Error::Decompression(format!(
                "raw prefix at {prefix_start:#x} exceeds payload of {} bytes",
                data.len()
            ))
        })?;
    let stream = &data[HEADER_LEN..prefix_start];

    if body_len > stream_len.saturating_mul(8 * MAX_BYTES_PER_BIT) {
        return Err(Error::Decompression(format!(
            "body of {body_len} bytes cannot come from a {stream_len}-byte bitstream"
        )));
    }

    output.clear();
    output.resize(PREFIX_LEN + body_len, 0);
    output[..PREFIX_LEN].copy_from_slice(prefix);

    let end = PREFIX_LEN + body_len;
    let mut bits = BackwardBits::new(stream);
    let mut written = 0usize;

    while written < body_len {
        let pos = end - 1 - written;
        let exhausted = || {
            Error::Decompression(format!(
                "bitstream exhausted after {written} of {body_len} bytes"
            ))
        };

        if bits.read(1).ok_or_else(exhausted)? == 1 {
            let distance = bits.read(DISTANCE_BITS).ok_or_else(exhausted)? as usize + MIN_DISTANCE;
            let length = read_length(&mut bits).ok_or_else(exhausted)?;

            if pos + distance >= end {
                return Err(Error::Decompression(format!(
                    "back-reference distance {distance} at {pos:#x} points past output end"
                )));
            }
            if length > body_len - written {
                return Err(Error::Decompression(format!(
                    "back-reference length {length} overruns output ({} bytes left)",
                    body_len - written
                )));
            }

            for i in 0..length {
                output[pos - i] = output[pos - i + distance];
            }
            written += length;
        } else {
            output[pos] = bits.read(8).ok_or_else(exhausted)? as u8;
            written += 1;
        }
    }

    Ok(())
}

fn read_length(bits: &mut BackwardBits<'_>) -> Option<usize> {
    let mut length = MIN_MATCH;

    for width in LENGTH_LEVELS {
        let level = bits.read(width)? as usize;
        length += level;
        if level != (1 << width) - 1 {
            return Some(length);
        }
    }

    loop {
        let level = bits.read(8)? as usize;
        length += level;
        if level != 0xFF {
            return Some(length);
        }
    }
}

/// MSB-first bit reader walking a byte slice from the end.
struct BackwardBits<'a> {
    data: &'a [u8],
    /// Index one past the next byte to load.
    next: usize,
    pool: u8,
    available: u32,
}

impl<'a> BackwardBits<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            next: data.len(),
            pool: 0,
            available: 0,
        }
    }

    fn read(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        let mut produced = 0;

        while produced < count {
            if self.available == 0 {
                self.next = self.next.checked_sub(1)?;
                self.pool = self.data[self.next];
                self.available = 8;
            }

            let take = self.available.min(count - produced);
            let chunk = (self.pool as u32 >> (self.available - take)) & ((1 << take) - 1);
            value = (value << take) | chunk;
            self.available -= take;
            produced += take;
        }

        Some(value)
    }
}

/// Compress `data` into a CRILAYLA payload.
///
/// The first 0x100 bytes are stored raw, so `data` must be at least that long.
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < PREFIX_LEN {
        return Err(Error::Truncated {
            what: "CRILAYLA raw prefix",
            needed: PREFIX_LEN as u64,
            available: data.len() as u64,
        });
    }

    let (prefix, body) = data.split_at(PREFIX_LEN);
    let body_len = u32::try_from(body.len())
        .map_err(|_| Error::Decompression(format!("body of {} bytes is too large", body.len())))?;

    // The decoder emits the body back to front, so the encoder works on the
    // reversed body as an ordinary forward LZ77 stream.
    let reversed: Vec<u8> = body.iter().rev().copied().collect();
    let mut matcher = Matcher::new(reversed.len());
    let mut bits = BitWriter::default();
    let mut pos = 0;

    while pos < reversed.len() {
        let (distance, length) = matcher.longest(&reversed, pos);

        if length >= MIN_MATCH {
            bits.write(1, 1);
            bits.write((distance - MIN_DISTANCE) as u32, DISTANCE_BITS);
            write_length(&mut bits, length);
            for p in pos..pos + length {
                matcher.insert(&reversed, p);
            }
            pos += length;
        } else {
            bits.write(0, 1);
            bits.write(reversed[pos] as u32, 8);
            matcher.insert(&reversed, pos);
            pos += 1;
        }
    }

    let mut stream = bits.finish();
    stream.reverse();

    let mut out = Vec::with_capacity(HEADER_LEN + stream.len() + PREFIX_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&(stream.len() as u32).to_le_bytes());
    out.extend_from_slice(&stream);
    out.extend_from_slice(prefix);
    Ok(out)
}

fn write_length(bits: &mut BitWriter, length: usize) {
    let mut rest = length - MIN_MATCH;

    for width in LENGTH_LEVELS {
        let max = (1usize << width) - 1;
        if rest < max {
            bits.write(rest as u32, width);
            return;
        }
        bits.write(max as u32, width);
        rest -= max;
    }

    loop {
        if rest < 0xFF {
            bits.write(rest as u32, 8);
            return;
        }
        bits.write(0xFF, 8);
        rest -= 0xFF;
    }
}

/// MSB-first bit writer.
#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u32,
}

impl BitWriter {
    fn write(&mut self, value: u32, count: u32) {
        for shift in (0..count).rev() {
            let bit = ((value >> shift) & 1) as u8;
            self.current |= bit << (7 - self.used);
            self.used += 1;
            if self.used == 8 {
                self.bytes.push(self.current);
                self.current = 0;
                self.used = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.bytes.push(self.current);
        }
        self.bytes
    }
}

const NO_POSITION: usize = usize::MAX;
const MAX_CHAIN: usize = 64;
const NICE_LENGTH: usize = 258;

/// Hash-chain match finder over 3-byte prefixes.
struct Matcher {
    head: HashMap<[u8; 3], usize>,
    prev: Vec<usize>,
}

impl Matcher {
    fn new(len: usize) -> Self {
        Self {
            head: HashMap::new(),
            prev: vec![NO_POSITION; len],
        }
    }

    fn key(data: &[u8], pos: usize) -> Option<[u8; 3]> {
        data.get(pos..pos + 3).map(|k| [k[0], k[1], k[2]])
    }

    fn insert(&mut self, data: &[u8], pos: usize) {
        if let Some(key) = Self::key(data, pos) {
            self.prev[pos] = self.head.insert(key, pos).unwrap_or(NO_POSITION);
        }
    }

    /// Longest earlier match for `pos` as `(distance, length)`.
    fn longest(&self, data: &[u8], pos: usize) -> (usize, usize) {
        let Some(key) = Self::key(data, pos) else {
            return (0, 0);
        };

        let limit = data.len() - pos;
        let mut best = (0, 0);
        let mut candidate = self.head.get(&key).copied().unwrap_or(NO_POSITION);
        let mut chain = 0;

        while candidate != NO_POSITION && chain < MAX_CHAIN {
            let distance = pos - candidate;
            if distance > MAX_DISTANCE {
                break;
            }
            if distance >= MIN_DISTANCE {
                let length = data[candidate..]
                    .iter()
                    .zip(&data[pos..pos + limit])
                    .take_while(|(a, b)| a == b)
                    .count();
                if length > best.1 {
                    best = (distance, length);
                    if length >= NICE_LENGTH {
                        break;
                    }
                }
            }
            candidate = self.prev[candidate];
            chain += 1;
        }

        best
    }
}
