//! CRC-32C (Castagnoli) used by the software checksum operations.
//!
//! [`crc32c_update`] is the raw register update: no pre- or post-inversion is
//! applied, so callers can chain it across scatter-list segments. The checksum
//! operations of the framework seed the register with `!seed` and report the
//! register as-is, leaving any final inversion to the caller.

/// Reflected Castagnoli polynomial (0x1EDC6F41 bit-reversed).
const POLY: u32 = 0x82F6_3B78;

/// Byte-at-a-time lookup table, computed at compile time.
static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Feeds `data` into the CRC register `crc` and returns the new register.
///
/// # Examples
///
/// ```
/// use offload_core::crc32c::crc32c_update;
///
/// let whole = crc32c_update(!0, b"hello world");
/// let split = crc32c_update(crc32c_update(!0, b"hello "), b"world");
/// assert_eq!(whole, split);
/// ```
#[must_use]
pub fn crc32c_update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        crc = TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc
}

/// Standard CRC-32C of `data` (init `!0`, final XOR `!0`).
///
/// # Examples
///
/// ```
/// use offload_core::crc32c::crc32c;
///
/// assert_eq!(crc32c(b"123456789"), 0xE306_9283);
/// ```
#[must_use]
pub fn crc32c(data: &[u8]) -> u32 {
    !crc32c_update(!0, data)
}
