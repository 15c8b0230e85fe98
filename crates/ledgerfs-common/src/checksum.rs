//! Checksum utilities for LedgerFS
//!
//! Two algorithms are in use: CRC32C for metadata-node framing and
//! CRC-64 (ECMA polynomial, reflected) for replay-log transactions.

use crc::{Crc, CRC_64_XZ};

/// CRC-64 with the ECMA-182 polynomial, reflected in and out.
const CRC64_ECMA: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Compute the CRC-64/ECMA checksum of `data`
#[inline]
#[must_use]
pub fn crc64_ecma(data: &[u8]) -> u64 {
    CRC64_ECMA.checksum(data)
}

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}
