// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Consumer surface: attach validation, policy-driven reads, heartbeat.
//!
//! Attaching validates the segment (magic through optional config match,
//! first failure wins) and claims one consumer-table row; the row carries
//! the read cursor and heartbeat and is freed on clean close or by the
//! dead-consumer sweeper. Reads go through [`ReadHandle`], a scoped
//! capability that releases the slot on drop and reports the generation
//! race when validation failed.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::block::DataBlock;
use crate::broker::ChannelBroker;
use crate::checksum;
use crate::config::{ChecksumPolicy, ConsumerSyncPolicy, DataBlockConfig};
use crate::error::{FabricError, Result};
use crate::flexzone::FlexZone;
use crate::header::{ConsumerRecord, CountersSnapshot};
use crate::platform;
use crate::ring;
use crate::schema::Schema;

/// Read side of a DataBlock segment.
#[derive(Debug)]
pub struct Consumer {
    block: DataBlock,
    row: usize,
    consumer_id: u64,
    sync: ConsumerSyncPolicy,
    checksum_policy: ChecksumPolicy,
    checksum_enabled: bool,
    slot_schema: Option<Schema>,
    flex_schema: Option<Schema>,
    /// Slots lost to ring overrun, local to this handle.
    slots_dropped: AtomicU64,
    closed: bool,
}

impl Consumer {
    /// Attach to a segment.
    ///
    /// Runs the structured validation chain (magic, version, ABI hash,
    /// layout checksum, secret, optional schema hashes, optional
    /// field-by-field config match), then reserves a consumer-table row.
    pub fn attach(
        name: &str,
        secret: u64,
        expected_config: Option<&DataBlockConfig>,
        slot_schema: Option<Schema>,
        flex_schema: Option<Schema>,
    ) -> Result<Self> {
        let expected = expected_config.map(DataBlockConfig::validated).transpose()?;

        let block = DataBlock::attach(name)?;
        block.header().validate_attach(
            name,
            secret,
            expected.as_ref(),
            slot_schema.as_ref().map(Schema::hash),
            flex_schema.as_ref().map(Schema::hash),
        )?;

        let sync = block.header().sync_policy()?;
        let checksum_policy = block.header().checksum_policy()?;
        let checksum_enabled = block.header().checksum_enabled != 0;

        // FifoAll starts at the commit frontier (no replay of old slots);
        // LatestOnly starts at 0 so the current freshest slot is readable
        // immediately.
        let initial_cursor = match sync {
            ConsumerSyncPolicy::FifoAll => block.header().commit_index.load(Ordering::Acquire),
            ConsumerSyncPolicy::LatestOnly => 0,
        };

        let consumer_id = Self::make_consumer_id();
        let row = block
            .header()
            .claim_consumer_row(consumer_id, initial_cursor)
            .ok_or_else(|| {
                FabricError::Unsupported(format!(
                    "consumer table full ({} rows)",
                    crate::header::MAX_CONSUMERS
                ))
            })?;

        log::info!("[FAB] consumer {consumer_id:#x} attached to {name} (row {row})");
        Ok(Self {
            block,
            row,
            consumer_id,
            sync,
            checksum_policy,
            checksum_enabled,
            slot_schema,
            flex_schema,
            slots_dropped: AtomicU64::new(0),
            closed: false,
        })
    }

    /// Resolve a broker channel and attach to the advertised segment.
    pub fn discover(
        broker: &dyn ChannelBroker,
        channel: &str,
        expected_config: Option<&DataBlockConfig>,
        slot_schema: Option<Schema>,
        flex_schema: Option<Schema>,
    ) -> Result<Self> {
        let ad = broker.discover_producer(channel)?;
        Self::attach(
            &ad.segment_name,
            ad.secret,
            expected_config,
            slot_schema,
            flex_schema,
        )
    }

    fn make_consumer_id() -> u64 {
        let pid = u64::from(platform::current_pid());
        // Low 32 bits from the monotonic clock keep ids from one process
        // distinct; 0 is reserved for "free row".
        let nonce = platform::monotonic_now_ns() & 0xFFFF_FFFF;
        let id = (pid << 32) | nonce;
        if id == 0 {
            1
        } else {
            id
        }
    }

    fn record(&self) -> &ConsumerRecord {
        &self.block.header().consumers[self.row]
    }

    /// Acquire the next readable slot per the sync policy.
    ///
    /// Blocks up to `timeout` (`Some(Duration::ZERO)` = single probe,
    /// `None` = wait indefinitely). Returns `NotReady` when nothing became
    /// readable within the budget, `ChecksumFailed` under the Enforce
    /// policy when the slot bytes do not match their stored digest.
    pub fn acquire_next_read(&self, timeout: Option<Duration>) -> Result<ReadHandle<'_>> {
        let deadline =
            timeout.map(|t| platform::monotonic_now_ns().saturating_add(t.as_nanos() as u64));
        let header = self.block.header();
        let capacity = header.ring_buffer_capacity;
        let mut backoff = Backoff::new();

        loop {
            let commit_index = header.commit_index.load(Ordering::Acquire);
            let cursor = self.record().last_read_index.load(Ordering::Acquire);

            match ring::plan_read(self.sync, commit_index, cursor, capacity) {
                Ok(plan) => {
                    let state = self.block.slot_state(plan.index);
                    match state.begin_read() {
                        Ok(generation) => {
                            // Lap check: a fast producer may have rewritten
                            // this slot for a newer sequence between the
                            // plan and the acquisition. Re-plan rather than
                            // hand out mislabeled data.
                            if header.commit_index.load(Ordering::Acquire) - plan.seq
                                > u64::from(capacity)
                            {
                                state.end_read(self.block.counters(), false);
                                continue;
                            }

                            let len = state.committed_len() as usize;

                            if self.checksum_enabled
                                && checksum::auto_verify(self.checksum_policy)
                                && !checksum::verify_slot(&self.block, plan.index, len)
                            {
                                state.end_read(self.block.counters(), false);
                                checksum::count_failure(&self.block);
                                // FifoAll skips the poisoned slot so the
                                // stream keeps progressing; LatestOnly
                                // retries the freshest on the next call.
                                if self.sync == ConsumerSyncPolicy::FifoAll {
                                    self.record()
                                        .last_read_index
                                        .store(plan.next_cursor, Ordering::Release);
                                }
                                return Err(FabricError::ChecksumFailed { slot: plan.index });
                            }

                            // Another thread of this consumer may have
                            // taken the same plan; the cursor CAS decides.
                            if self
                                .record()
                                .last_read_index
                                .compare_exchange(
                                    cursor,
                                    plan.next_cursor,
                                    Ordering::AcqRel,
                                    Ordering::Relaxed,
                                )
                                .is_err()
                            {
                                state.end_read(self.block.counters(), false);
                                continue;
                            }

                            self.slots_dropped.fetch_add(plan.dropped, Ordering::Relaxed);
                            self.update_heartbeat();

                            return Ok(ReadHandle {
                                consumer: self,
                                seq: plan.seq,
                                index: plan.index,
                                generation,
                                len,
                                raced: Cell::new(false),
                            });
                        }
                        Err(FabricError::NotReady) => {
                            // Writer holds the slot right now; fall through
                            // to the wait.
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(FabricError::NotReady) => {}
                Err(e) => return Err(e),
            }

            if let Some(d) = deadline {
                if platform::monotonic_now_ns() >= d {
                    return Err(FabricError::NotReady);
                }
            }
            backoff.wait();
        }
    }

    /// Transaction facade: acquire, run `f`, validate, release.
    ///
    /// The closure's result is only returned when the post-read validation
    /// confirms the bytes were coherent; a lost generation race surfaces as
    /// the retriable `NotReady`.
    pub fn with_read<R, F>(&self, timeout: Option<Duration>, f: F) -> Result<R>
    where
        F: FnOnce(&ReadHandle<'_>) -> R,
    {
        let handle = self.acquire_next_read(timeout)?;
        let result = f(&handle);
        if handle.validate() {
            Ok(result)
        } else {
            Err(FabricError::NotReady)
        }
    }

    /// Read view of the flexible zone.
    #[must_use]
    pub fn flex_zone(&self) -> FlexZone<'_> {
        FlexZone::new(&self.block, self.flex_schema.as_ref())
    }

    /// Verify the flexible zone against its stored checksum.
    #[must_use]
    pub fn verify_flex_zone(&self) -> bool {
        checksum::verify_flex(&self.block)
    }

    /// Accept the current flexible-zone bytes as local truth, bypassing the
    /// stored checksum. Returns a private copy.
    #[must_use]
    pub fn accept_flex_zone(&self) -> Vec<u8> {
        self.flex_zone().bytes().to_vec()
    }

    /// Refresh this consumer's heartbeat.
    pub fn update_heartbeat(&self) {
        self.record()
            .heartbeat_ns
            .store(platform::monotonic_now_ns(), Ordering::Release);
    }

    /// Producer liveness as seen from this consumer.
    #[must_use]
    pub fn producer_alive(&self) -> bool {
        self.block.producer_alive().1
    }

    /// Slots this consumer lost to ring overrun.
    #[must_use]
    pub fn slots_dropped(&self) -> u64 {
        self.slots_dropped.load(Ordering::Relaxed)
    }

    /// Shared counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> CountersSnapshot {
        self.block.counters().snapshot()
    }

    /// This consumer's table id.
    #[must_use]
    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    /// Clean close: free the consumer-table row.
    pub fn close(mut self) {
        self.release_row();
    }

    fn release_row(&mut self) {
        if !self.closed {
            self.block.header().free_consumer_row(self.row);
            self.closed = true;
            log::debug!("[FAB] consumer {:#x} closed", self.consumer_id);
        }
    }

    pub(crate) fn block(&self) -> &DataBlock {
        &self.block
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.release_row();
    }
}

/// Scoped read capability for one slot.
///
/// Carries the generation snapshot taken at acquisition; [`ReadHandle::validate`]
/// is the exact-equality check to run before trusting anything derived from
/// [`ReadHandle::payload`]. Dropping releases the slot and reports an
/// observed race on the shared counter.
#[derive(Debug)]
pub struct ReadHandle<'a> {
    consumer: &'a Consumer,
    seq: u64,
    index: u32,
    generation: u64,
    len: usize,
    raced: Cell<bool>,
}

impl ReadHandle<'_> {
    /// Monotonic slot sequence read.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Ring index of the slot.
    #[must_use]
    pub fn slot_index(&self) -> u32 {
        self.index
    }

    /// Committed payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length commits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The committed payload bytes.
    ///
    /// Content is only trustworthy after [`ReadHandle::validate`] returns
    /// true; a writer racing this reader tears the bytes but never the
    /// bounds.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        // SAFETY: this handle holds a read acquisition; len was clamped to
        // the stride at commit. Torn content is handled by validate().
        unsafe { self.consumer.block.payload(self.index, self.len) }
    }

    /// Field `idx` of the payload per the slot schema.
    pub fn field(&self, idx: usize) -> Result<&[u8]> {
        let schema = self.consumer.slot_schema.as_ref().ok_or_else(|| {
            FabricError::ConfigInvalid("no slot schema bound".into())
        })?;
        schema.field_slice(self.payload(), idx)
    }

    /// Exact-equality generation check: true iff no writer has started on
    /// this slot since acquisition.
    #[must_use]
    pub fn validate(&self) -> bool {
        let ok = self
            .consumer
            .block
            .slot_state(self.index)
            .validate(self.generation);
        if !ok {
            self.raced.set(true);
        }
        ok
    }
}

impl Drop for ReadHandle<'_> {
    fn drop(&mut self) {
        self.consumer
            .block
            .slot_state(self.index)
            .end_read(self.consumer.block.counters(), self.raced.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataBlockPolicy, PageSize};
    use crate::producer::Producer;

    fn unique_name() -> String {
        format!(
            "/memfab_constest_{}_{}",
            platform::current_pid(),
            platform::monotonic_now_ns()
        )
    }

    fn config(sync: ConsumerSyncPolicy, checksum: ChecksumPolicy) -> DataBlockConfig {
        DataBlockConfig {
            ring_buffer_capacity: Some(4),
            physical_page_size: Some(PageSize::Page4K),
            logical_unit_size: 128,
            flexible_zone_size: 4096,
            policy: Some(DataBlockPolicy::RingBuffer),
            consumer_sync_policy: Some(sync),
            checksum_policy: checksum,
            checksum_enabled: true,
            spinlock_index: None,
        }
    }

    fn produce(p: &Producer, data: &[u8]) {
        p.with_write(None, |h| {
            h.write_bytes(data)?;
            Ok(data.len())
        })
        .unwrap();
    }

    #[test]
    fn test_attach_claims_and_close_frees_row() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();

        let c = Consumer::attach(&name, 5, Some(&cfg), None, None).unwrap();
        let id = c.consumer_id();
        assert_eq!(ConsumerRecord::pid_of(id), platform::current_pid());

        let header = p.block().header();
        let occupied = header
            .consumers
            .iter()
            .filter(|r| r.consumer_id.load(Ordering::Acquire) != 0)
            .count();
        assert_eq!(occupied, 1);

        c.close();
        let occupied = header
            .consumers
            .iter()
            .filter(|r| r.consumer_id.load(Ordering::Acquire) != 0)
            .count();
        assert_eq!(occupied, 0);

        p.unlink().ok();
    }

    #[test]
    fn test_attach_wrong_secret() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();
        assert!(matches!(
            Consumer::attach(&name, 6, None, None, None),
            Err(FabricError::SecretMismatch)
        ));
        p.unlink().ok();
    }

    #[test]
    fn test_fifo_stream_in_order() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();
        let c = Consumer::attach(&name, 5, None, None, None).unwrap();

        for i in 0..3u8 {
            produce(&p, &[i; 4]);
        }
        for i in 0..3u8 {
            let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
            assert_eq!(h.seq(), u64::from(i));
            assert_eq!(h.payload(), &[i; 4]);
            assert!(h.validate());
        }
        // Frontier reached.
        assert!(matches!(
            c.acquire_next_read(Some(Duration::ZERO)),
            Err(FabricError::NotReady)
        ));
        assert_eq!(c.metrics().reader_races, 0);

        p.unlink().ok();
    }

    #[test]
    fn test_fifo_starts_at_attach_frontier() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();

        produce(&p, b"before");
        let c = Consumer::attach(&name, 5, None, None, None).unwrap();
        // The pre-attach commit is not replayed.
        assert!(matches!(
            c.acquire_next_read(Some(Duration::ZERO)),
            Err(FabricError::NotReady)
        ));
        produce(&p, b"after!");
        let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(h.payload(), b"after!");

        p.unlink().ok();
    }

    #[test]
    fn test_latest_only_reads_freshest_and_never_regresses() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::LatestOnly, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();
        let c = Consumer::attach(&name, 5, None, None, None).unwrap();

        for i in 1..=10u8 {
            produce(&p, &[i]);
        }
        let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(h.payload(), &[10]);
        drop(h);

        // Same commit frontier: the same slot is never handed out twice.
        assert!(matches!(
            c.acquire_next_read(Some(Duration::ZERO)),
            Err(FabricError::NotReady)
        ));

        produce(&p, &[11]);
        let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(h.payload(), &[11]);

        p.unlink().ok();
    }

    #[test]
    fn test_fifo_laggard_drops() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();
        let c = Consumer::attach(&name, 5, None, None, None).unwrap();

        // Capacity is 4; 10 commits overrun the idle consumer.
        for i in 0..10u8 {
            produce(&p, &[i]);
        }
        let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(h.seq(), 6);
        assert_eq!(h.payload(), &[6]);
        drop(h);
        assert_eq!(c.slots_dropped(), 6);

        p.unlink().ok();
    }

    #[test]
    fn test_enforce_checksum_failure() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Enforce);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();
        let c = Consumer::attach(&name, 5, None, None, None).unwrap();

        produce(&p, b"good");
        // Corrupt the committed bytes without updating the digest.
        // SAFETY: no writer holds the slot; the test is the only process.
        unsafe {
            p.block().payload_mut(0)[0] = b'X';
        }

        let err = c
            .acquire_next_read(Some(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, FabricError::ChecksumFailed { slot: 0 }));
        assert_eq!(c.metrics().checksum_failures, 1);

        // FifoAll skipped the poisoned slot; the stream continues.
        produce(&p, b"next");
        let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(h.payload(), b"next");

        p.unlink().ok();
    }

    #[test]
    fn test_with_read_facade() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();
        let c = Consumer::attach(&name, 5, None, None, None).unwrap();

        produce(&p, b"txn");
        let copied = c
            .with_read(Some(Duration::from_millis(200)), |h| h.payload().to_vec())
            .unwrap();
        assert_eq!(copied, b"txn");
        // Handle released on exit.
        assert_eq!(
            p.block().slot_state(0).reader_count.load(Ordering::Acquire),
            0
        );

        p.unlink().ok();
    }

    #[test]
    fn test_typed_field_access() {
        use crate::schema::{FieldKind, SchemaField};
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let schema = Schema::new(
            "Sample",
            vec![
                SchemaField::scalar("seq", FieldKind::U32),
                SchemaField::scalar("value", FieldKind::U64),
            ],
        )
        .unwrap();

        let p = Producer::create(&name, &cfg, 5, Some(schema.clone()), None).unwrap();
        let c = Consumer::attach(&name, 5, None, Some(schema.clone()), None).unwrap();

        p.with_write(None, |h| {
            h.field_mut(0)?.copy_from_slice(&7u32.to_le_bytes());
            h.field_mut(1)?.copy_from_slice(&1234u64.to_le_bytes());
            Ok(schema.packed_size())
        })
        .unwrap();

        let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
        let seq = u32::from_le_bytes(h.field(0).unwrap().try_into().unwrap());
        let value = u64::from_le_bytes(h.field(1).unwrap().try_into().unwrap());
        assert_eq!((seq, value), (7, 1234));
        assert!(h.validate());

        p.unlink().ok();
    }

    #[test]
    fn test_schema_mismatch_at_attach() {
        use crate::schema::{FieldKind, SchemaField};
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let written =
            Schema::new("A", vec![SchemaField::scalar("x", FieldKind::U32)]).unwrap();
        let expected =
            Schema::new("B", vec![SchemaField::scalar("x", FieldKind::U64)]).unwrap();

        let p = Producer::create(&name, &cfg, 5, Some(written), None).unwrap();
        assert!(matches!(
            Consumer::attach(&name, 5, None, Some(expected), None),
            Err(FabricError::SchemaMismatch("slot"))
        ));
        assert_eq!(p.metrics().schema_mismatches, 1);

        p.unlink().ok();
    }

    #[test]
    fn test_discover_via_broker() {
        use crate::broker::InProcBroker;
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 9, None, None).unwrap();

        let broker = InProcBroker::new();
        p.advertise(&broker, "lab/scope", 1).unwrap();

        let c = Consumer::discover(&broker, "lab/scope", None, None, None).unwrap();
        produce(&p, b"found");
        let h = c.acquire_next_read(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(h.payload(), b"found");

        assert!(matches!(
            Consumer::discover(&broker, "lab/unknown", None, None, None),
            Err(FabricError::NotFound(_))
        ));

        p.unlink().ok();
    }

    #[test]
    fn test_producer_liveness_visible() {
        let name = unique_name();
        let cfg = config(ConsumerSyncPolicy::FifoAll, ChecksumPolicy::Manual);
        let p = Producer::create(&name, &cfg, 5, None, None).unwrap();
        let c = Consumer::attach(&name, 5, None, None, None).unwrap();
        assert!(c.producer_alive());
        p.unlink().ok();
    }
}
