// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segment layout derivation.
//!
//! # Region order
//!
//! ```text
//! +--------------------------------------------------------------+
//! | SegmentHeader (one 4K page)                                  |
//! +--------------------------------------------------------------+
//! | SlotRwState[capacity]      (64 bytes each, 4K-aligned start) |
//! +--------------------------------------------------------------+
//! | SlotChecksum[capacity]     (32 bytes each, 4K-aligned start) |
//! +--------------------------------------------------------------+
//! | FlexibleZone               (4K-aligned start and size)       |
//! +--------------------------------------------------------------+
//! | StructuredBuffer           (capacity x slot_stride)          |
//! +--------------------------------------------------------------+
//! ```
//!
//! Offsets are a pure function of the layout-defining fields, so a layout
//! derived from a `DataBlockConfig` and one derived from the header of a
//! segment created with that config are identical. Nothing else in the
//! crate computes offsets; all region math flows through [`SegmentLayout`].

use crate::config::{DataBlockConfig, PageSize, ResolvedConfig};
use crate::error::Result;
use crate::hashing::DIGEST_SIZE;
use crate::header::{SegmentHeader, HEADER_SIZE};
use crate::slot::SLOT_STATE_SIZE;

/// Alignment of every region start.
pub const REGION_ALIGN: usize = 4096;

/// Round `v` up to the next multiple of [`REGION_ALIGN`].
#[inline]
#[must_use]
pub const fn align_region(v: usize) -> usize {
    (v + REGION_ALIGN - 1) & !(REGION_ALIGN - 1)
}

/// Resolved region offsets and sizes for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    /// Number of slots.
    pub slot_count: u32,
    /// Resolved slot stride in bytes (sentinel already applied).
    pub slot_stride: u32,
    /// Offset of the `SlotRwState` array.
    pub slot_state_offset: usize,
    /// Offset of the slot checksum array.
    pub slot_checksum_offset: usize,
    /// Offset of the flexible zone.
    pub flex_zone_offset: usize,
    /// Flexible-zone size rounded up to 4 KiB (0 when unconfigured).
    pub flex_zone_size: usize,
    /// Offset of the structured data buffer.
    pub buffer_offset: usize,
    /// Total segment size in bytes.
    pub total_size: usize,
}

impl SegmentLayout {
    /// Derive the layout from a validated configuration.
    pub fn from_config(config: &DataBlockConfig) -> Result<Self> {
        Ok(Self::from_resolved(&config.validated()?))
    }

    /// Derive the layout from the header of an attached segment.
    ///
    /// Produces the same result as [`SegmentLayout::from_config`] for the
    /// configuration the segment was created with.
    pub fn from_header(header: &SegmentHeader) -> Result<Self> {
        let page = PageSize::from_bytes(header.physical_page_size)?;
        let stride = if header.logical_unit_size == 0 {
            page.bytes()
        } else {
            header.logical_unit_size
        };
        Ok(Self::compute(
            header.ring_buffer_capacity,
            stride,
            header.flexible_zone_size,
        ))
    }

    /// Derive the layout from an already-validated configuration.
    #[must_use]
    pub fn from_resolved(resolved: &ResolvedConfig) -> Self {
        Self::compute(
            resolved.ring_buffer_capacity,
            resolved.slot_stride(),
            resolved.flexible_zone_size,
        )
    }

    fn compute(capacity: u32, stride: u32, flex_size: u32) -> Self {
        let slot_state_offset = HEADER_SIZE;
        let slot_checksum_offset =
            align_region(slot_state_offset + capacity as usize * SLOT_STATE_SIZE);
        let flex_zone_offset =
            align_region(slot_checksum_offset + capacity as usize * DIGEST_SIZE);
        let flex_zone_size = align_region(flex_size as usize);
        let buffer_offset = align_region(flex_zone_offset + flex_zone_size);
        let total_size = buffer_offset + capacity as usize * stride as usize;

        Self {
            slot_count: capacity,
            slot_stride: stride,
            slot_state_offset,
            slot_checksum_offset,
            flex_zone_offset,
            flex_zone_size,
            buffer_offset,
            total_size,
        }
    }

    /// Byte offset of slot `i` in the structured buffer.
    #[inline]
    #[must_use]
    pub fn slot_payload_offset(&self, i: u32) -> usize {
        debug_assert!(i < self.slot_count);
        self.buffer_offset + i as usize * self.slot_stride as usize
    }
}
