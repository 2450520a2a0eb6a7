// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Attached-segment wrapper: typed accessors over the raw regions.
//!
//! A [`DataBlock`] owns one mapping of a segment and knows its layout. All
//! pointer arithmetic into the segment lives here; producer, consumer, and
//! doctor go through these accessors and never compute offsets themselves.
//!
//! Attaching is a two-step map: the first page is mapped alone to read the
//! layout-defining header fields, then the full segment is mapped at the
//! size the layout dictates.

use std::sync::atomic::Ordering;

use crate::config::ResolvedConfig;
use crate::error::Result;
use crate::hashing::DIGEST_SIZE;
use crate::header::{FabricCounters, SegmentHeader, HEADER_SIZE};
use crate::layout::SegmentLayout;
use crate::segment::ShmSegment;
use crate::slot::SlotRwState;

/// One process's mapping of a DataBlock segment.
#[derive(Debug)]
pub struct DataBlock {
    segment: ShmSegment,
    layout: SegmentLayout,
}

impl DataBlock {
    /// Create and initialize a fresh segment.
    ///
    /// The mapping is kernel-zeroed, which is the valid initial state for
    /// every region except the header; the header is written in place last
    /// so another process can never observe a valid magic over garbage.
    pub fn create(
        name: &str,
        resolved: &ResolvedConfig,
        secret: u64,
        slot_schema_hash: [u8; DIGEST_SIZE],
        flex_schema_hash: [u8; DIGEST_SIZE],
    ) -> Result<Self> {
        let layout = SegmentLayout::from_resolved(resolved);
        let segment = ShmSegment::create(name, layout.total_size)?;

        // SAFETY: the mapping starts with HEADER_SIZE bytes of zeroed,
        // page-aligned, exclusively-owned memory (nobody else can have a
        // valid attach before the magic is written by this ptr::write).
        unsafe {
            std::ptr::write(
                segment.as_ptr().cast::<SegmentHeader>(),
                SegmentHeader::new(resolved, secret, name, slot_schema_hash, flex_schema_hash),
            );
        }

        log::info!(
            "[FAB] created segment {name}: {} slots x {} bytes, {} total",
            layout.slot_count,
            layout.slot_stride,
            layout.total_size
        );
        Ok(Self { segment, layout })
    }

    /// Attach to an existing segment.
    ///
    /// Probes the header page, checks identity and layout binding
    /// ([`SegmentHeader::validate_core`]), then remaps at full size.
    /// Callers add their own secret/schema/config checks on top.
    pub fn attach(name: &str) -> Result<Self> {
        let probe = ShmSegment::open(name, HEADER_SIZE)?;
        // SAFETY: the probe mapping covers HEADER_SIZE bytes, mmap returns
        // page-aligned memory, and SegmentHeader is exactly one page with
        // atomic runtime-mutable fields.
        let header = unsafe { &*probe.as_ptr().cast::<SegmentHeader>() };
        header.validate_core(name)?;
        let layout = SegmentLayout::from_header(header)?;
        drop(probe);

        let segment = ShmSegment::open(name, layout.total_size)?;
        Ok(Self { segment, layout })
    }

    /// Segment header.
    #[inline]
    #[must_use]
    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: every constructor mapped at least HEADER_SIZE bytes and
        // verified (create) or validated (attach) the header content; the
        // mapping is page-aligned as SegmentHeader requires.
        unsafe { &*self.segment.as_ptr().cast::<SegmentHeader>() }
    }

    /// Shared counters (header convenience).
    #[inline]
    #[must_use]
    pub fn counters(&self) -> &FabricCounters {
        &self.header().counters
    }

    /// Region layout.
    #[inline]
    #[must_use]
    pub fn layout(&self) -> &SegmentLayout {
        &self.layout
    }

    /// Segment name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Coordination state of slot `index`.
    #[inline]
    #[must_use]
    pub fn slot_state(&self, index: u32) -> &SlotRwState {
        debug_assert!(index < self.layout.slot_count);
        // SAFETY: the layout places slot_count SlotRwState records at a
        // 4K-aligned offset (64-byte alignment follows); index is bounded
        // by the debug_assert and every caller's ring math (seq % count).
        unsafe {
            &*self
                .segment
                .as_ptr()
                .add(self.layout.slot_state_offset)
                .cast::<SlotRwState>()
                .add(index as usize)
        }
    }

    /// Stored checksum of slot `index`.
    #[must_use]
    pub fn slot_checksum(&self, index: u32) -> [u8; DIGEST_SIZE] {
        debug_assert!(index < self.layout.slot_count);
        let mut digest = [0u8; DIGEST_SIZE];
        // SAFETY: the checksum array holds slot_count 32-byte entries
        // inside the mapping; a read racing an update yields a torn digest,
        // which at worst fails verification.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.segment
                    .as_ptr()
                    .add(self.layout.slot_checksum_offset + index as usize * DIGEST_SIZE),
                digest.as_mut_ptr(),
                DIGEST_SIZE,
            );
        }
        digest
    }

    /// Store the checksum of slot `index`. Caller holds the slot write lock
    /// (producer commit) or is the recovery path.
    pub fn set_slot_checksum(&self, index: u32, digest: &[u8; DIGEST_SIZE]) {
        debug_assert!(index < self.layout.slot_count);
        // SAFETY: same bounds as slot_checksum; writes are serialized by
        // the slot write lock or by recovery.
        unsafe {
            std::ptr::copy_nonoverlapping(
                digest.as_ptr(),
                self.segment
                    .as_ptr()
                    .add(self.layout.slot_checksum_offset + index as usize * DIGEST_SIZE),
                DIGEST_SIZE,
            );
        }
    }

    /// Borrow `len` payload bytes of slot `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold a read acquisition on the slot (or be the
    /// recovery path) and must validate the generation before trusting the
    /// bytes; a concurrent writer makes the content torn, never the access
    /// out of bounds (len is checked against the stride).
    #[must_use]
    pub unsafe fn payload(&self, index: u32, len: usize) -> &[u8] {
        debug_assert!(len <= self.layout.slot_stride as usize);
        std::slice::from_raw_parts(
            self.segment.as_ptr().add(self.layout.slot_payload_offset(index)),
            len.min(self.layout.slot_stride as usize),
        )
    }

    /// Mutably borrow the full payload stride of slot `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold the slot write lock with the slot in `Writing`
    /// state, which is what makes this the only mutable view.
    #[must_use]
    pub unsafe fn payload_mut(&self, index: u32) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.segment.as_ptr().add(self.layout.slot_payload_offset(index)),
            self.layout.slot_stride as usize,
        )
    }

    /// Borrow the flexible zone.
    ///
    /// # Safety
    ///
    /// Concurrent producer mutation can tear the content; consumers guard
    /// against that with the zone checksum (Enforce) or by accepting
    /// current bytes explicitly.
    #[must_use]
    pub unsafe fn flex_bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(
            self.segment.as_ptr().add(self.layout.flex_zone_offset),
            self.layout.flex_zone_size,
        )
    }

    /// Mutably borrow the flexible zone.
    ///
    /// # Safety
    ///
    /// The caller must hold the configured spinlock (producer) so there is
    /// exactly one mutator.
    #[must_use]
    pub unsafe fn flex_bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.segment.as_ptr().add(self.layout.flex_zone_offset),
            self.layout.flex_zone_size,
        )
    }

    /// Unlink the segment name. Creator cleanup.
    pub fn unlink(&self) -> Result<()> {
        ShmSegment::unlink(self.segment.name())
    }

    /// Producer liveness: recorded pid plus its current aliveness.
    #[must_use]
    pub fn producer_alive(&self) -> (u32, bool) {
        let pid = self.header().producer_pid.load(Ordering::Acquire);
        (pid, crate::platform::is_process_alive(pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ChecksumPolicy, ConsumerSyncPolicy, DataBlockConfig, DataBlockPolicy, PageSize,
    };
    use crate::header::MAGIC;

    fn unique_name() -> String {
        format!(
            "/memfab_blocktest_{}_{}",
            crate::platform::current_pid(),
            crate::platform::monotonic_now_ns()
        )
    }

    fn resolved() -> ResolvedConfig {
        DataBlockConfig {
            ring_buffer_capacity: Some(4),
            physical_page_size: Some(PageSize::Page4K),
            logical_unit_size: 256,
            flexible_zone_size: 4096,
            policy: Some(DataBlockPolicy::RingBuffer),
            consumer_sync_policy: Some(ConsumerSyncPolicy::FifoAll),
            checksum_policy: ChecksumPolicy::Manual,
            checksum_enabled: true,
            spinlock_index: Some(0),
        }
        .validated()
        .unwrap()
    }

    #[test]
    fn test_create_attach_layout_roundtrip() {
        let name = unique_name();
        let created = DataBlock::create(&name, &resolved(), 7, [0u8; 32], [0u8; 32]).unwrap();
        assert_eq!(created.header().magic, MAGIC);

        let attached = DataBlock::attach(&name).unwrap();
        assert_eq!(created.layout(), attached.layout());
        assert_eq!(
            attached.layout(),
            &SegmentLayout::from_header(attached.header()).unwrap()
        );

        created.unlink().ok();
    }

    #[test]
    fn test_slot_state_shared_between_mappings() {
        let name = unique_name();
        let a = DataBlock::create(&name, &resolved(), 7, [0u8; 32], [0u8; 32]).unwrap();
        let b = DataBlock::attach(&name).unwrap();

        a.slot_state(2).write_lock.store(1234, Ordering::Release);
        assert_eq!(b.slot_state(2).write_lock.load(Ordering::Acquire), 1234);

        a.unlink().ok();
    }

    #[test]
    fn test_payload_shared_between_mappings() {
        let name = unique_name();
        let a = DataBlock::create(&name, &resolved(), 7, [0u8; 32], [0u8; 32]).unwrap();
        let b = DataBlock::attach(&name).unwrap();

        // SAFETY: test is the only writer; no readers are registered.
        unsafe {
            a.payload_mut(1)[..4].copy_from_slice(&[9, 8, 7, 6]);
        }
        // SAFETY: bytes were fully written above; no concurrent writer.
        let got = unsafe { b.payload(1, 4) }.to_vec();
        assert_eq!(got, vec![9, 8, 7, 6]);

        a.unlink().ok();
    }

    #[test]
    fn test_slot_checksum_storage() {
        let name = unique_name();
        let block = DataBlock::create(&name, &resolved(), 7, [0u8; 32], [0u8; 32]).unwrap();

        assert_eq!(block.slot_checksum(3), [0u8; 32]);
        block.set_slot_checksum(3, &[0xAB; 32]);
        assert_eq!(block.slot_checksum(3), [0xAB; 32]);
        // Neighbors untouched.
        assert_eq!(block.slot_checksum(2), [0u8; 32]);

        block.unlink().ok();
    }

    #[test]
    fn test_attach_missing_segment() {
        assert!(matches!(
            DataBlock::attach("/memfab_blocktest_nope"),
            Err(crate::error::FabricError::NotFound(_))
        ));
    }

    #[test]
    fn test_attach_rejects_foreign_magic() {
        let name = unique_name();
        // A raw segment without a memfab header.
        let seg = ShmSegment::create(&name, HEADER_SIZE).unwrap();
        drop(seg);
        assert!(matches!(
            DataBlock::attach(&name),
            Err(crate::error::FabricError::Incompatible { .. })
        ));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn test_producer_alive_reflects_creator() {
        let name = unique_name();
        let block = DataBlock::create(&name, &resolved(), 7, [0u8; 32], [0u8; 32]).unwrap();
        let (pid, alive) = block.producer_alive();
        assert_eq!(pid, crate::platform::current_pid());
        assert!(alive);
        block.unlink().ok();
    }
}
