// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Producer surface: segment creation and the write side of the protocol.
//!
//! A [`Producer`] is created once per segment by the creator process. Slot
//! writes go through [`WriteHandle`], a scoped capability for exactly one
//! slot: commit consumes the handle, and dropping an uncommitted handle
//! aborts the write, so the slot protocol releases on every exit path
//! (success, error, panic).

use std::time::Duration;

use crate::block::DataBlock;
use crate::broker::{ChannelAd, ChannelBroker};
use crate::checksum;
use crate::config::{DataBlockConfig, ResolvedConfig};
use crate::error::{FabricError, Result, TimeoutKind};
use crate::flexzone::{FlexZone, FlexZoneMut};
use crate::header::CountersSnapshot;
use crate::platform;
use crate::ring;
use crate::schema::Schema;
use crate::spinlock::SharedSpinlock;

/// Write side of a DataBlock segment.
#[derive(Debug)]
pub struct Producer {
    block: DataBlock,
    resolved: ResolvedConfig,
    slot_schema: Option<Schema>,
    flex_schema: Option<Schema>,
}

impl Producer {
    /// Create the segment and become its producer.
    ///
    /// The single point of validation: config invariants, schema-vs-layout
    /// fit, everything is checked before any segment bytes exist.
    pub fn create(
        name: &str,
        config: &DataBlockConfig,
        secret: u64,
        slot_schema: Option<Schema>,
        flex_schema: Option<Schema>,
    ) -> Result<Self> {
        let resolved = config.validated()?;

        if let Some(schema) = &slot_schema {
            if schema.packed_size() > resolved.slot_stride() as usize {
                return Err(FabricError::ConfigInvalid(format!(
                    "slot schema '{}' needs {} bytes, slot stride is {}",
                    schema.name(),
                    schema.packed_size(),
                    resolved.slot_stride()
                )));
            }
        }
        if let Some(schema) = &flex_schema {
            if schema.packed_size() > resolved.flexible_zone_size as usize {
                return Err(FabricError::ConfigInvalid(format!(
                    "flex schema '{}' needs {} bytes, zone is {}",
                    schema.name(),
                    schema.packed_size(),
                    resolved.flexible_zone_size
                )));
            }
        }

        let slot_hash = slot_schema.as_ref().map_or([0u8; 32], Schema::hash);
        let flex_hash = flex_schema.as_ref().map_or([0u8; 32], Schema::hash);
        let block = DataBlock::create(name, &resolved, secret, slot_hash, flex_hash)?;

        // Stamp the digest of the zeroed zone so a pristine segment passes
        // integrity validation.
        if resolved.checksum_enabled && resolved.flexible_zone_size > 0 {
            checksum::update_flex(&block);
        }

        Ok(Self {
            block,
            resolved,
            slot_schema,
            flex_schema,
        })
    }

    /// Advertise this segment on a broker channel. Bind time only.
    pub fn advertise(
        &self,
        broker: &dyn ChannelBroker,
        channel: &str,
        schema_version: u32,
    ) -> Result<()> {
        let header = self.block.header();
        broker.register_producer(
            channel,
            ChannelAd {
                segment_name: self.block.name().to_string(),
                secret: header.secret,
                slot_schema_hash: header.slot_schema_hash,
                flex_schema_hash: header.flex_schema_hash,
                schema_version,
            },
        )
    }

    /// Acquire the next write slot per the ring policy.
    ///
    /// `None` waits indefinitely; `Some(Duration::ZERO)` is a single
    /// attempt. The whole acquisition (including re-planning after a lost
    /// slot race) shares one deadline.
    pub fn acquire_write(&self, timeout: Option<Duration>) -> Result<WriteHandle<'_>> {
        let deadline =
            timeout.map(|t| platform::monotonic_now_ns().saturating_add(t.as_nanos() as u64));
        let header = self.block.header();

        loop {
            let plan = ring::plan_write(header);
            let state = self.block.slot_state(plan.index);
            state.begin_write(self.block.counters(), remaining(deadline))?;

            // Another writer thread may have committed this sequence while
            // we waited for the lock; never commit against a stale index.
            if ring::write_plan_current(header, plan) {
                return Ok(WriteHandle {
                    producer: self,
                    seq: plan.seq,
                    index: plan.index,
                    committed: false,
                });
            }

            let fresh = ring::plan_write(header);
            if fresh.index == plan.index {
                // Same slot backs the new sequence; adopt it.
                return Ok(WriteHandle {
                    producer: self,
                    seq: fresh.seq,
                    index: fresh.index,
                    committed: false,
                });
            }

            // The committed payload in this slot is untouched; restore its
            // visibility and move to the slot the ring points at now.
            state
                .slot_state
                .store(crate::slot::SlotState::Committed as u32, std::sync::atomic::Ordering::Release);
            state.release_lock();

            if let Some(d) = deadline {
                if platform::monotonic_now_ns() >= d {
                    self.block
                        .counters()
                        .writer_lock_timeouts
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    return Err(FabricError::Timeout(TimeoutKind::WaitLock));
                }
            }
        }
    }

    /// Transaction facade: acquire, let `f` fill the payload, commit the
    /// length it returns. Release is guaranteed on every exit path; an
    /// error from `f` aborts the write.
    pub fn with_write<F>(&self, timeout: Option<Duration>, f: F) -> Result<u64>
    where
        F: FnOnce(&mut WriteHandle<'_>) -> Result<usize>,
    {
        let mut handle = self.acquire_write(timeout)?;
        let len = f(&mut handle)?;
        handle.commit(len)
    }

    /// Read view of the flexible zone.
    #[must_use]
    pub fn flex_zone(&self) -> FlexZone<'_> {
        FlexZone::new(&self.block, self.flex_schema.as_ref())
    }

    /// Mutable view of the flexible zone.
    ///
    /// Takes the configured spinlock (bounded by `timeout`) for the view's
    /// lifetime. Under Update/Enforce policies the zone checksum refreshes
    /// when the view drops.
    pub fn flex_zone_mut(&self, timeout: Option<Duration>) -> Result<FlexZoneMut<'_>> {
        let guard = match self.spinlock() {
            Some(lock) => Some(match timeout {
                Some(t) => lock.try_lock_for(t)?,
                None => lock.lock()?,
            }),
            None => None,
        };
        let auto = self.resolved.checksum_enabled
            && checksum::auto_update(self.resolved.checksum_policy);
        Ok(FlexZoneMut::new(
            &self.block,
            self.flex_schema.as_ref(),
            auto,
            guard,
        ))
    }

    /// Recompute and store the flexible-zone checksum explicitly.
    pub fn update_flex_zone_checksum(&self) {
        checksum::update_flex(&self.block);
    }

    /// Refresh the producer-side heartbeat for consumer monitoring.
    pub fn update_heartbeat(&self) {
        self.block.header().update_producer_heartbeat();
    }

    /// Shared counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> CountersSnapshot {
        self.block.counters().snapshot()
    }

    /// Segment name.
    #[must_use]
    pub fn segment_name(&self) -> &str {
        self.block.name()
    }

    /// Unlink the segment name; mappings live until every attacher drops.
    pub fn unlink(&self) -> Result<()> {
        self.block.unlink()
    }

    fn spinlock(&self) -> Option<SharedSpinlock<'_>> {
        let idx = self.block.header().spinlock_index;
        if idx < 0 {
            return None;
        }
        Some(SharedSpinlock::new(
            &self.block.header().spinlocks[idx as usize],
            self.block.counters(),
        ))
    }

    pub(crate) fn block(&self) -> &DataBlock {
        &self.block
    }
}

#[inline]
fn remaining(deadline: Option<u64>) -> Option<Duration> {
    deadline.map(|d| {
        Duration::from_nanos(d.saturating_sub(platform::monotonic_now_ns()))
    })
}

/// Scoped write capability for one slot.
///
/// Dropping without committing aborts the write (slot back to `Empty`, no
/// generation bump).
#[derive(Debug)]
pub struct WriteHandle<'a> {
    producer: &'a Producer,
    seq: u64,
    index: u32,
    committed: bool,
}

impl WriteHandle<'_> {
    /// Monotonic slot sequence being written.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Ring index of the slot.
    #[must_use]
    pub fn slot_index(&self) -> u32 {
        self.index
    }

    /// The full slot stride, writable.
    #[must_use]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: this handle holds the slot write lock with the slot in
        // Writing state, making it the unique mutator.
        unsafe { self.producer.block.payload_mut(self.index) }
    }

    /// Copy `data` into the slot. Fails when it exceeds the stride.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let stride = self.producer.resolved.slot_stride() as usize;
        if data.len() > stride {
            return Err(FabricError::ConfigInvalid(format!(
                "payload of {} bytes exceeds slot stride {stride}",
                data.len()
            )));
        }
        self.payload_mut()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Writable field `idx` per the slot schema.
    pub fn field_mut(&mut self, idx: usize) -> Result<&mut [u8]> {
        let schema = self.producer.slot_schema.as_ref().ok_or_else(|| {
            FabricError::ConfigInvalid("no slot schema bound".into())
        })?;
        // SAFETY: as payload_mut.
        let bytes = unsafe { self.producer.block.payload_mut(self.index) };
        schema.field_slice_mut(bytes, idx)
    }

    /// Commit `len` payload bytes and release the slot.
    ///
    /// Order: checksum stamp (Update/Enforce), generation bump + state
    /// publish, ring index advance, lock release. Returns the committed
    /// generation.
    pub fn commit(mut self, len: usize) -> Result<u64> {
        let stride = self.producer.resolved.slot_stride() as usize;
        if len > stride {
            return Err(FabricError::ConfigInvalid(format!(
                "commit of {len} bytes exceeds slot stride {stride}"
            )));
        }

        let block = &self.producer.block;
        if self.producer.resolved.checksum_enabled
            && checksum::auto_update(self.producer.resolved.checksum_policy)
        {
            checksum::update_slot(block, self.index, len);
        }

        let state = block.slot_state(self.index);
        let generation = state.commit_payload(len as u32);
        ring::publish_commit(block.header(), self.seq);
        state.release_lock();

        self.committed = true;
        Ok(generation)
    }

    /// Abort explicitly. Equivalent to dropping the handle.
    pub fn abort(self) {
        // Drop impl performs the abort.
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.producer.block.slot_state(self.index).abort_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChecksumPolicy, ConsumerSyncPolicy, DataBlockPolicy, PageSize};
    use crate::slot::SlotState;

    fn unique_name() -> String {
        format!(
            "/memfab_prodtest_{}_{}",
            platform::current_pid(),
            platform::monotonic_now_ns()
        )
    }

    fn config(policy: ChecksumPolicy) -> DataBlockConfig {
        DataBlockConfig {
            ring_buffer_capacity: Some(4),
            physical_page_size: Some(PageSize::Page4K),
            logical_unit_size: 128,
            flexible_zone_size: 4096,
            policy: Some(DataBlockPolicy::RingBuffer),
            consumer_sync_policy: Some(ConsumerSyncPolicy::FifoAll),
            checksum_policy: policy,
            checksum_enabled: true,
            spinlock_index: Some(1),
        }
    }

    #[test]
    fn test_create_rejects_unset_fields() {
        let name = unique_name();
        let mut cfg = config(ChecksumPolicy::Manual);
        cfg.policy = None;
        assert!(matches!(
            Producer::create(&name, &cfg, 1, None, None),
            Err(FabricError::ConfigInvalid(_))
        ));
        // Single-point validation: nothing was created.
        assert!(!crate::segment::ShmSegment::exists(&name));
    }

    #[test]
    fn test_create_rejects_oversized_slot_schema() {
        let name = unique_name();
        let schema = Schema::new(
            "Big",
            vec![crate::schema::SchemaField::array(
                "blob",
                crate::schema::FieldKind::Bytes,
                4096,
            )],
        )
        .unwrap();
        // Stride is 128, the schema wants 4096.
        assert!(matches!(
            Producer::create(&name, &config(ChecksumPolicy::Manual), 1, Some(schema), None),
            Err(FabricError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_write_commit_advances_ring() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Manual), 1, None, None).unwrap();

        let mut h = p.acquire_write(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(h.seq(), 0);
        assert_eq!(h.slot_index(), 0);
        h.write_bytes(b"payload-0").unwrap();
        let generation = h.commit(9).unwrap();
        assert_eq!(generation, 1);

        let header = p.block().header();
        assert_eq!(header.write_index.load(std::sync::atomic::Ordering::Acquire), 1);
        assert_eq!(header.commit_index.load(std::sync::atomic::Ordering::Acquire), 1);
        assert_eq!(p.block().slot_state(0).state(), Some(SlotState::Committed));
        assert_eq!(p.block().slot_state(0).committed_len(), 9);

        p.unlink().ok();
    }

    #[test]
    fn test_drop_aborts_without_advancing() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Manual), 1, None, None).unwrap();

        {
            let mut h = p.acquire_write(None).unwrap();
            h.write_bytes(b"doomed").unwrap();
            // Dropped uncommitted.
        }

        let header = p.block().header();
        assert_eq!(header.write_index.load(std::sync::atomic::Ordering::Acquire), 0);
        assert_eq!(header.commit_index.load(std::sync::atomic::Ordering::Acquire), 0);
        assert_eq!(p.block().slot_state(0).state(), Some(SlotState::Empty));

        // The next acquire reuses the same sequence: no gap.
        let h = p.acquire_write(None).unwrap();
        assert_eq!(h.seq(), 0);
        h.abort();

        p.unlink().ok();
    }

    #[test]
    fn test_commit_too_large_rejected() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Manual), 1, None, None).unwrap();
        let h = p.acquire_write(None).unwrap();
        assert!(matches!(
            h.commit(4096),
            Err(FabricError::ConfigInvalid(_))
        ));
        // Commit consumed the handle; the failed commit aborted via drop.
        assert_eq!(p.block().slot_state(0).state(), Some(SlotState::Empty));
        p.unlink().ok();
    }

    #[test]
    fn test_update_policy_stamps_checksum() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Update), 1, None, None).unwrap();

        p.with_write(None, |h| {
            h.write_bytes(b"summed")?;
            Ok(6)
        })
        .unwrap();

        assert!(checksum::verify_slot(p.block(), 0, 6));
        p.unlink().ok();
    }

    #[test]
    fn test_manual_policy_does_not_stamp() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Manual), 1, None, None).unwrap();
        p.with_write(None, |h| {
            h.write_bytes(b"plain")?;
            Ok(5)
        })
        .unwrap();
        assert_eq!(p.block().slot_checksum(0), [0u8; 32]);
        p.unlink().ok();
    }

    #[test]
    fn test_with_write_aborts_on_closure_error() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Manual), 1, None, None).unwrap();

        let result = p.with_write(None, |_h| Err(FabricError::NotReady));
        assert!(result.is_err());
        assert_eq!(p.block().slot_state(0).state(), Some(SlotState::Empty));
        assert_eq!(
            p.block()
                .header()
                .write_index
                .load(std::sync::atomic::Ordering::Acquire),
            0
        );
        p.unlink().ok();
    }

    #[test]
    fn test_ring_wraps_over_capacity() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Manual), 1, None, None).unwrap();

        for i in 0..6u8 {
            let seq = p
                .with_write(None, |h| {
                    h.write_bytes(&[i])?;
                    Ok(1)
                })
                .unwrap();
            assert!(seq >= 1);
        }
        // Slot 1 was written by seq 1 and seq 5: generation 2.
        assert_eq!(
            p.block()
                .slot_state(1)
                .write_generation
                .load(std::sync::atomic::Ordering::Acquire),
            2
        );
        p.unlink().ok();
    }

    #[test]
    fn test_flex_zone_mut_auto_checksum() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Update), 1, None, None).unwrap();

        {
            let mut zone = p.flex_zone_mut(Some(Duration::from_millis(100))).unwrap();
            zone.bytes_mut()[..4].copy_from_slice(b"zone");
        }
        assert!(checksum::verify_flex(p.block()));
        assert_eq!(&p.flex_zone().bytes()[..4], b"zone");
        p.unlink().ok();
    }

    #[test]
    fn test_heartbeat_advances() {
        let name = unique_name();
        let p = Producer::create(&name, &config(ChecksumPolicy::Manual), 1, None, None).unwrap();
        let before = p
            .block()
            .header()
            .producer_heartbeat_ns
            .load(std::sync::atomic::Ordering::Acquire);
        std::thread::sleep(Duration::from_millis(2));
        p.update_heartbeat();
        let after = p
            .block()
            .header()
            .producer_heartbeat_ns
            .load(std::sync::atomic::Ordering::Acquire);
        assert!(after > before);
        p.unlink().ok();
    }
}
