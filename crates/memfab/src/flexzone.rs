// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flexible-zone access views.
//!
//! The flexible zone is a producer-owned, consumer-read-only region for
//! small shared state that is neither per-slot nor header. The API exposes
//! exactly two shapes of access:
//!
//! - the whole zone as a byte span;
//! - one field by **zone index**, with offsets derived from the agreed
//!   schema. Raw offsets never cross the API boundary.
//!
//! Mutation goes through [`FlexZoneMut`], which holds the configured
//! shared spinlock for its lifetime and (under Update/Enforce policies)
//! refreshes the zone checksum when dropped.

use crate::block::DataBlock;
use crate::checksum;
use crate::error::{FabricError, Result};
use crate::schema::Schema;
use crate::spinlock::SpinlockGuard;

/// Read-only view of the flexible zone.
pub struct FlexZone<'a> {
    block: &'a DataBlock,
    schema: Option<&'a Schema>,
}

impl<'a> FlexZone<'a> {
    pub(crate) fn new(block: &'a DataBlock, schema: Option<&'a Schema>) -> Self {
        Self { block, schema }
    }

    /// The whole zone.
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        // SAFETY: read-only view; torn reads under concurrent producer
        // mutation are guarded by the zone checksum at the policy level.
        unsafe { self.block.flex_bytes() }
    }

    /// Zone size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.block.layout().flex_zone_size
    }

    /// True when no flexible zone was configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Field `idx` per the agreed zone schema.
    pub fn field(&self, idx: usize) -> Result<&'a [u8]> {
        let schema = self
            .schema
            .ok_or_else(|| FabricError::ConfigInvalid("no flex-zone schema bound".into()))?;
        schema.field_slice(self.bytes(), idx)
    }
}

/// Mutable view of the flexible zone; producer only.
///
/// Holds the configured spinlock for its lifetime, serializing multi-field
/// updates. On drop the zone checksum is refreshed when `auto_checksum`
/// was requested (Update/Enforce policies).
pub struct FlexZoneMut<'a> {
    block: &'a DataBlock,
    schema: Option<&'a Schema>,
    auto_checksum: bool,
    _guard: Option<SpinlockGuard<'a>>,
}

impl<'a> FlexZoneMut<'a> {
    pub(crate) fn new(
        block: &'a DataBlock,
        schema: Option<&'a Schema>,
        auto_checksum: bool,
        guard: Option<SpinlockGuard<'a>>,
    ) -> Self {
        Self {
            block,
            schema,
            auto_checksum,
            _guard: guard,
        }
    }

    /// The whole zone, writable.
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: this view exists only while the producer holds the zone
        // spinlock (or no spinlock was claimed, in which case the producer
        // is the documented single mutator).
        unsafe { self.block.flex_bytes_mut() }
    }

    /// The whole zone, read-only.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: as bytes_mut; shared view of the mutator's own region.
        unsafe { self.block.flex_bytes() }
    }

    /// Writable field `idx` per the agreed zone schema.
    pub fn field_mut(&mut self, idx: usize) -> Result<&mut [u8]> {
        let schema = self
            .schema
            .ok_or_else(|| FabricError::ConfigInvalid("no flex-zone schema bound".into()))?;
        // SAFETY: as bytes_mut.
        let bytes = unsafe { self.block.flex_bytes_mut() };
        schema.field_slice_mut(bytes, idx)
    }
}

impl Drop for FlexZoneMut<'_> {
    fn drop(&mut self) {
        if self.auto_checksum {
            checksum::update_flex(self.block);
        }
        // The spinlock guard releases after the checksum covers the final
        // bytes.
    }
}
