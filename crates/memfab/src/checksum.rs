// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Slot and flexible-zone checksum lifecycle.
//!
//! BLAKE2b-256 over the committed payload bytes (slots) or the entire zone
//! (flex). The per-segment [`ChecksumPolicy`] decides who does the work:
//!
//! - `Manual`: nothing happens automatically; these functions are the
//!   explicit entry points.
//! - `Update`: the producer stores digests on commit and zone mutation;
//!   consumers do not verify.
//! - `Enforce`: producer stores, consumers verify before handing data out.
//!
//! Slot digests are stored *before* the `Committed` state store, so an
//! Enforce consumer can never observe a committed slot without a digest. A
//! digest that later stops matching (external corruption) is reported by
//! integrity validation and counted, never silently rewritten.

use crate::block::DataBlock;
use crate::config::ChecksumPolicy;
use crate::hashing::{self, DIGEST_SIZE};

/// True when the producer should store digests automatically.
#[inline]
#[must_use]
pub fn auto_update(policy: ChecksumPolicy) -> bool {
    matches!(policy, ChecksumPolicy::Update | ChecksumPolicy::Enforce)
}

/// True when consumers must verify before releasing data.
#[inline]
#[must_use]
pub fn auto_verify(policy: ChecksumPolicy) -> bool {
    matches!(policy, ChecksumPolicy::Enforce)
}

/// Compute the digest of `len` payload bytes of a slot.
///
/// Caller coordinates access: either it holds the slot write lock, or it
/// accepts that a racing writer produces a digest that will simply fail
/// verification.
#[must_use]
pub fn compute_slot(block: &DataBlock, index: u32, len: usize) -> [u8; DIGEST_SIZE] {
    // SAFETY: len is clamped to the slot stride by the accessor; access
    // coordination is the caller's documented responsibility.
    let payload = unsafe { block.payload(index, len) };
    hashing::blake2b_256(payload)
}

/// Compute and store the digest for a slot. Producer commit path and
/// integrity repair.
pub fn update_slot(block: &DataBlock, index: u32, len: usize) {
    let digest = compute_slot(block, index, len);
    block.set_slot_checksum(index, &digest);
}

/// Verify a slot's stored digest against its current bytes.
#[must_use]
pub fn verify_slot(block: &DataBlock, index: u32, len: usize) -> bool {
    block.slot_checksum(index) == compute_slot(block, index, len)
}

/// Compute the digest of the whole flexible zone.
#[must_use]
pub fn compute_flex(block: &DataBlock) -> [u8; DIGEST_SIZE] {
    // SAFETY: the zone span is always valid; a racing mutation yields a
    // digest that fails verification, nothing worse.
    let zone = unsafe { block.flex_bytes() };
    hashing::blake2b_256(zone)
}

/// Compute and store the flexible-zone digest.
pub fn update_flex(block: &DataBlock) {
    block.header().set_flex_zone_checksum(compute_flex(block));
}

/// Verify the stored flexible-zone digest against current bytes.
#[must_use]
pub fn verify_flex(block: &DataBlock) -> bool {
    block.header().flex_zone_checksum() == compute_flex(block)
}

/// Report a consumer-side verification failure on the shared counter.
pub fn count_failure(block: &DataBlock) {
    block
        .counters()
        .checksum_failures
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}
