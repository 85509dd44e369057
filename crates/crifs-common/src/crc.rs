//! CRC-32 hashing utilities.
//!
//! CRI's archive obfuscation is built on the standard reflected CRC-32
//! (polynomial `0xEDB88320`, the ISO-HDLC / zlib variant). File names are
//! hashed with it to derive cipher keys, and the keystream generator runs the
//! raw table lookups directly, which is why the table itself is public.

/// Reflected CRC-32 polynomial.
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

/// CRC-32 lookup table, computed at compile time.
pub const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Feed one byte into a raw (uncomplemented) CRC register.
#[inline(always)]
pub const fn update(register: u32, byte: u8) -> u32 {
    (register >> 8) ^ TABLE[((register ^ byte as u32) & 0xFF) as usize]
}

/// Compute the CRC-32 of a byte slice.
///
/// Uses hardware acceleration when available (PCLMULQDQ on x86).
#[inline]
pub fn hash_bytes(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Compute the CRC-32 of a string's UTF-8 bytes.
#[inline]
pub fn hash_str(s: &str) -> u32 {
    hash_bytes(s.as_bytes())
}

/// Table-driven CRC-32, byte at a time.
///
/// Produces the same value as [`hash_bytes`]; kept as the reference the
/// keystream generator is checked against.
pub fn hash_bytes_table(data: &[u8]) -> u32 {
    !data.iter().fold(0xFFFF_FFFF, |crc, &b| update(crc, b))
}
