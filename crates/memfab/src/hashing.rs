// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! BLAKE2b-256 hashing helpers.
//!
//! One algorithm for every digest in the fabric: schema hashes, the header
//! ABI hash, the layout checksum, slot checksums, and the flexible-zone
//! checksum. All digests are raw 32-byte values.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// BLAKE2b with a 32-byte output.
type Blake2b256 = Blake2b<U32>;

/// Size of every digest stored in the segment.
pub const DIGEST_SIZE: usize = 32;

/// Hash a byte range.
#[must_use]
pub fn blake2b_256(data: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash several byte ranges as one message.
///
/// Equivalent to hashing the concatenation; avoids building it.
#[must_use]
pub fn blake2b_256_parts(parts: &[&[u8]]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Hash a segment name for use as a segment-identity component.
#[must_use]
pub fn hash_name(name: &str) -> [u8; DIGEST_SIZE] {
    blake2b_256(name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = blake2b_256(b"memfab");
        let b = blake2b_256(b"memfab");
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_differs_on_input() {
        assert_ne!(blake2b_256(b"a"), blake2b_256(b"b"));
    }

    #[test]
    fn test_parts_equal_concatenation() {
        let whole = blake2b_256(b"hello world");
        let parts = blake2b_256_parts(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_empty_input_is_valid() {
        // Zero-length payloads are legal commits; their digest must be defined.
        let d = blake2b_256(&[]);
        assert_ne!(d, [0u8; DIGEST_SIZE]);
    }

    #[test]
    fn test_hash_name_matches_bytes() {
        assert_eq!(hash_name("/memfab_x"), blake2b_256(b"/memfab_x"));
    }
}
