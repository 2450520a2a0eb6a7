// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DataBlock configuration - single source of truth for segment creation.
//!
//! All layout-defining knobs live here. Required fields are `Option`s:
//! `None` means *unset*, and creation fails with `ConfigInvalid` before any
//! segment bytes exist. `logical_unit_size == 0` is the documented sentinel
//! for "one slot per physical page"; every access path reads the resolved
//! stride from the derived layout, never from this struct.

use crate::error::{FabricError, Result};

/// Supported physical page sizes for the structured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PageSize {
    /// 4 KiB pages.
    Page4K,
    /// 4 MiB pages.
    Page4M,
    /// 16 MiB pages.
    Page16M,
}

impl PageSize {
    /// Page size in bytes.
    #[must_use]
    pub fn bytes(self) -> u32 {
        match self {
            Self::Page4K => 4 * 1024,
            Self::Page4M => 4 * 1024 * 1024,
            Self::Page16M => 16 * 1024 * 1024,
        }
    }

    /// Reverse mapping used when re-deriving a layout from a header.
    pub fn from_bytes(bytes: u32) -> Result<Self> {
        match bytes {
            4_096 => Ok(Self::Page4K),
            4_194_304 => Ok(Self::Page4M),
            16_777_216 => Ok(Self::Page16M),
            other => Err(FabricError::Unsupported(format!(
                "physical page size {other} (supported: 4K, 4M, 16M)"
            ))),
        }
    }
}

/// Slot progression policy for the structured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataBlockPolicy {
    /// One slot, overwritten in place.
    Single,
    /// Two slots, writer alternates.
    DoubleBuffer,
    /// N slots in FIFO progression.
    RingBuffer,
}

impl DataBlockPolicy {
    /// Wire encoding stored in the header (0 is reserved for "unset").
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Single => 1,
            Self::DoubleBuffer => 2,
            Self::RingBuffer => 3,
        }
    }

    /// Decode from the header value.
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Single),
            2 => Ok(Self::DoubleBuffer),
            3 => Ok(Self::RingBuffer),
            other => Err(FabricError::Corrupt(format!("unknown policy value {other}"))),
        }
    }
}

/// How consumers progress through committed slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConsumerSyncPolicy {
    /// Always read the freshest committed slot; skipping is allowed.
    LatestOnly,
    /// Read every slot in order; laggards lose the oldest slots.
    FifoAll,
}

impl ConsumerSyncPolicy {
    /// Wire encoding stored in the header (0 is reserved for "unset").
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::LatestOnly => 1,
            Self::FifoAll => 2,
        }
    }

    /// Decode from the header value.
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::LatestOnly),
            2 => Ok(Self::FifoAll),
            other => Err(FabricError::Corrupt(format!(
                "unknown consumer sync policy value {other}"
            ))),
        }
    }
}

/// Checksum lifecycle policy, fixed at segment creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChecksumPolicy {
    /// Caller invokes update/verify explicitly.
    #[default]
    Manual,
    /// Producer updates on commit; consumers do not verify.
    Update,
    /// Producer updates; consumers verify before handing data out.
    Enforce,
}

impl ChecksumPolicy {
    /// Wire encoding stored in the header.
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Manual => 1,
            Self::Update => 2,
            Self::Enforce => 3,
        }
    }

    /// Decode from the header value.
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Manual),
            2 => Ok(Self::Update),
            3 => Ok(Self::Enforce),
            other => Err(FabricError::Corrupt(format!(
                "unknown checksum policy value {other}"
            ))),
        }
    }
}

/// Creation-time configuration of a DataBlock segment.
///
/// Required fields (`None` = unset, rejected at creation): `policy`,
/// `consumer_sync_policy`, `physical_page_size`, `ring_buffer_capacity`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DataBlockConfig {
    /// Number of slots in the structured buffer.
    pub ring_buffer_capacity: Option<u32>,
    /// Physical page size for the structured buffer.
    pub physical_page_size: Option<PageSize>,
    /// Slot stride in bytes; 0 = "equal to physical page size".
    pub logical_unit_size: u32,
    /// Flexible-zone size in bytes (rounded up to 4 KiB by the layout).
    pub flexible_zone_size: u32,
    /// Slot progression policy.
    pub policy: Option<DataBlockPolicy>,
    /// Consumer progression policy.
    pub consumer_sync_policy: Option<ConsumerSyncPolicy>,
    /// Checksum lifecycle.
    pub checksum_policy: ChecksumPolicy,
    /// Master switch for the checksum arrays.
    pub checksum_enabled: bool,
    /// Spinlock pool index guarding flexible-zone mutation; `None` = unclaimed.
    pub spinlock_index: Option<u8>,
}

impl DataBlockConfig {
    /// Start an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            checksum_enabled: true,
            ..Self::default()
        }
    }

    /// Validate and resolve the required fields.
    ///
    /// Single point of validation: every invariant is checked here, before
    /// any segment bytes exist.
    pub fn validated(&self) -> Result<ResolvedConfig> {
        let policy = self
            .policy
            .ok_or_else(|| FabricError::ConfigInvalid("policy is unset".into()))?;
        let sync = self.consumer_sync_policy.ok_or_else(|| {
            FabricError::ConfigInvalid("consumer_sync_policy is unset".into())
        })?;
        let page = self.physical_page_size.ok_or_else(|| {
            FabricError::ConfigInvalid("physical_page_size is unset".into())
        })?;
        let capacity = self.ring_buffer_capacity.ok_or_else(|| {
            FabricError::ConfigInvalid("ring_buffer_capacity is unset".into())
        })?;

        match policy {
            DataBlockPolicy::Single if capacity != 1 => {
                return Err(FabricError::ConfigInvalid(format!(
                    "Single policy requires capacity 1, got {capacity}"
                )));
            }
            DataBlockPolicy::DoubleBuffer if capacity != 2 => {
                return Err(FabricError::ConfigInvalid(format!(
                    "DoubleBuffer policy requires capacity 2, got {capacity}"
                )));
            }
            DataBlockPolicy::RingBuffer if capacity < 2 => {
                return Err(FabricError::ConfigInvalid(format!(
                    "RingBuffer policy requires capacity >= 2, got {capacity}"
                )));
            }
            _ => {}
        }

        if self.logical_unit_size != 0 && self.logical_unit_size > page.bytes() {
            return Err(FabricError::ConfigInvalid(format!(
                "logical_unit_size {} exceeds physical page size {}",
                self.logical_unit_size,
                page.bytes()
            )));
        }

        if !self.checksum_enabled && self.checksum_policy != ChecksumPolicy::Manual {
            return Err(FabricError::ConfigInvalid(
                "checksum policy requires checksum_enabled".into(),
            ));
        }

        if let Some(idx) = self.spinlock_index {
            if usize::from(idx) >= crate::header::SPINLOCK_POOL_SIZE {
                return Err(FabricError::ConfigInvalid(format!(
                    "spinlock_index {idx} out of range (pool size {})",
                    crate::header::SPINLOCK_POOL_SIZE
                )));
            }
        }

        Ok(ResolvedConfig {
            ring_buffer_capacity: capacity,
            physical_page_size: page,
            logical_unit_size: self.logical_unit_size,
            flexible_zone_size: self.flexible_zone_size,
            policy,
            consumer_sync_policy: sync,
            checksum_policy: self.checksum_policy,
            checksum_enabled: self.checksum_enabled,
            spinlock_index: self.spinlock_index.map_or(-1, i32::from),
        })
    }
}

/// A [`DataBlockConfig`] with every required field present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub ring_buffer_capacity: u32,
    pub physical_page_size: PageSize,
    pub logical_unit_size: u32,
    pub flexible_zone_size: u32,
    pub policy: DataBlockPolicy,
    pub consumer_sync_policy: ConsumerSyncPolicy,
    pub checksum_policy: ChecksumPolicy,
    pub checksum_enabled: bool,
    /// Spinlock pool index; -1 = no spinlock claimed.
    pub spinlock_index: i32,
}

impl ResolvedConfig {
    /// Resolved slot stride: the logical unit size unless the sentinel 0
    /// selects the physical page size.
    #[must_use]
    pub fn slot_stride(&self) -> u32 {
        if self.logical_unit_size == 0 {
            self.physical_page_size.bytes()
        } else {
            self.logical_unit_size
        }
    }
}
