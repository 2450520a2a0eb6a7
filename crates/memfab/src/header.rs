// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Persistent segment header: identification, layout binding, shared state.
//!
//! The header occupies the first 4 KiB page of every segment. Field order is
//! canonical: identification, layout-defining fields, ring-buffer state,
//! consumer table, spinlock pool, metrics. The `align(4096)` padding at the
//! tail is reserved space, so the on-disk length stays constant when fields
//! are added.
//!
//! # Two hashes, two purposes
//!
//! - The **ABI hash** is BLAKE2b-256 over a static textual description of
//!   the header fields (name, type, order). It is computed from
//!   [`HEADER_ABI`], never from struct bytes, so it is independent of
//!   compiler packing and catches struct-layout drift between builds.
//! - The **layout checksum** is BLAKE2b-256 over the little-endian
//!   concatenation of the layout-defining values plus a segment-identity
//!   component (creation timestamp and segment-name hash). It guards the
//!   values that determine region offsets and binds them to this segment.
//!
//! # Mutability map
//!
//! Layout-defining and identification fields are written exactly once at
//! creation and read-only thereafter; they are plain fields. Everything
//! mutated at runtime is atomic, except the flexible-zone checksum, which
//! sits in an `UnsafeCell` and is serialized by the configured spinlock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::canon::CanonicalBuf;
use crate::config::{ChecksumPolicy, ConsumerSyncPolicy, DataBlockPolicy, ResolvedConfig};
use crate::error::{FabricError, Result};
use crate::hashing::{self, DIGEST_SIZE};
use crate::platform;

/// Magic number identifying memfab segments ("MFAB").
pub const MAGIC: u32 = 0x4D46_4142;

/// Current segment format version.
pub const VERSION: u32 = 1;

/// Header region size: exactly one 4 KiB page.
pub const HEADER_SIZE: usize = 4096;

/// Fixed capacity of the consumer table.
pub const MAX_CONSUMERS: usize = 64;

/// Fixed size of the shared spinlock pool.
pub const SPINLOCK_POOL_SIZE: usize = 16;

/// One consumer-table row. A free row has `consumer_id == 0`.
///
/// `consumer_id` embeds the owning pid in its high 32 bits so the
/// dead-consumer sweeper can run liveness checks without extra state.
#[repr(C)]
#[derive(Debug)]
pub struct ConsumerRecord {
    /// Nonzero while the row is claimed; high 32 bits = owner pid.
    pub consumer_id: AtomicU64,
    /// Sync-policy cursor: next sequence (FifoAll) or last consumed
    /// `commit_index` snapshot (LatestOnly).
    pub last_read_index: AtomicU64,
    /// Monotonic timestamp of the consumer's last heartbeat.
    pub heartbeat_ns: AtomicU64,
}

impl ConsumerRecord {
    const ZERO: Self = Self {
        consumer_id: AtomicU64::new(0),
        last_read_index: AtomicU64::new(0),
        heartbeat_ns: AtomicU64::new(0),
    };

    /// Pid embedded in a consumer id.
    #[inline]
    #[must_use]
    pub fn pid_of(consumer_id: u64) -> u32 {
        (consumer_id >> 32) as u32
    }
}

/// One shared spinlock: pid+tid ownership with an acquisition timestamp.
#[repr(C)]
#[derive(Debug)]
pub struct SpinlockSlot {
    /// Owning pid; 0 = free.
    pub owner_pid: AtomicU32,
    /// Owning kernel thread id.
    pub owner_tid: AtomicU32,
    /// Monotonic timestamp of acquisition.
    pub acquired_at_ns: AtomicU64,
}

impl SpinlockSlot {
    const ZERO: Self = Self {
        owner_pid: AtomicU32::new(0),
        owner_tid: AtomicU32::new(0),
        acquired_at_ns: AtomicU64::new(0),
    };
}

/// Shared error/event counters.
///
/// All counters use `Relaxed` ordering; values are eventually consistent.
/// Every error class on the fabric surface increments exactly one counter,
/// so operators can reason about rates without log parsing.
#[repr(C)]
#[derive(Debug)]
pub struct FabricCounters {
    /// Writer gave up waiting for the slot write lock.
    pub writer_lock_timeouts: AtomicU64,
    /// Writer acquired the lock but readers did not drain in time.
    pub writer_drain_timeouts: AtomicU64,
    /// Reader lost the generation race (torn read prevented).
    pub reader_races: AtomicU64,
    /// Attach rejected on a schema hash mismatch.
    pub schema_mismatches: AtomicU64,
    /// Coordination state reclaimed from a dead process.
    pub zombie_reclaims: AtomicU64,
    /// Stored checksum did not match slot or flex-zone bytes.
    pub checksum_failures: AtomicU64,
    /// Committed slots found with stale checksums by integrity validation.
    pub stale_checksums: AtomicU64,
    /// Consumer rows freed by the dead-consumer sweeper.
    pub consumer_evictions: AtomicU64,
}

impl FabricCounters {
    const ZERO: Self = Self {
        writer_lock_timeouts: AtomicU64::new(0),
        writer_drain_timeouts: AtomicU64::new(0),
        reader_races: AtomicU64::new(0),
        schema_mismatches: AtomicU64::new(0),
        zombie_reclaims: AtomicU64::new(0),
        checksum_failures: AtomicU64::new(0),
        stale_checksums: AtomicU64::new(0),
        consumer_evictions: AtomicU64::new(0),
    };

    /// Fresh counter block with everything at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self::ZERO
    }

    /// Non-atomic snapshot for reporting.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            writer_lock_timeouts: self.writer_lock_timeouts.load(Ordering::Relaxed),
            writer_drain_timeouts: self.writer_drain_timeouts.load(Ordering::Relaxed),
            reader_races: self.reader_races.load(Ordering::Relaxed),
            schema_mismatches: self.schema_mismatches.load(Ordering::Relaxed),
            zombie_reclaims: self.zombie_reclaims.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            stale_checksums: self.stale_checksums.load(Ordering::Relaxed),
            consumer_evictions: self.consumer_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FabricCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountersSnapshot {
    pub writer_lock_timeouts: u64,
    pub writer_drain_timeouts: u64,
    pub reader_races: u64,
    pub schema_mismatches: u64,
    pub zombie_reclaims: u64,
    pub checksum_failures: u64,
    pub stale_checksums: u64,
    pub consumer_evictions: u64,
}

impl std::fmt::Display for CountersSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FAB[lock_to={}, drain_to={}, races={}, schema={}, zombies={}, cksum={}, stale={}, evicted={}]",
            self.writer_lock_timeouts,
            self.writer_drain_timeouts,
            self.reader_races,
            self.schema_mismatches,
            self.zombie_reclaims,
            self.checksum_failures,
            self.stale_checksums,
            self.consumer_evictions
        )
    }
}

/// The segment header. Lives at offset 0 of every segment; exactly one page.
#[repr(C, align(4096))]
pub struct SegmentHeader {
    // --- identification ---
    pub magic: u32,
    pub version: u32,
    pub creation_timestamp_ns: u64,
    pub secret: u64,
    pub slot_schema_hash: [u8; DIGEST_SIZE],
    pub flex_schema_hash: [u8; DIGEST_SIZE],
    pub header_abi_hash: [u8; DIGEST_SIZE],
    pub layout_checksum: [u8; DIGEST_SIZE],
    /// Zone-wide checksum; written under the configured spinlock.
    flex_zone_checksum: UnsafeCell<[u8; DIGEST_SIZE]>,

    // --- layout-defining ---
    pub ring_buffer_capacity: u32,
    pub physical_page_size: u32,
    pub logical_unit_size: u32,
    pub flexible_zone_size: u32,
    pub policy: u32,
    pub consumer_sync_policy: u32,
    pub checksum_policy: u32,
    pub checksum_enabled: u32,
    /// Spinlock pool index guarding the flexible zone; -1 = unclaimed.
    pub spinlock_index: i32,
    _pad0: u32,

    // --- ring-buffer state ---
    /// Next slot sequence to acquire for writing.
    pub write_index: AtomicU64,
    /// Next slot sequence a consumer may read; slots below it are visible.
    pub commit_index: AtomicU64,
    /// Monotonic timestamp of the last recovery mutation.
    pub last_recovery_timestamp_ns: AtomicU64,
    /// Creator pid, for producer liveness monitoring.
    pub producer_pid: AtomicU32,
    _pad1: u32,
    /// Producer-side heartbeat.
    pub producer_heartbeat_ns: AtomicU64,

    // --- consumer table ---
    pub consumers: [ConsumerRecord; MAX_CONSUMERS],

    // --- spinlock pool ---
    pub spinlocks: [SpinlockSlot; SPINLOCK_POOL_SIZE],

    // --- metrics ---
    pub counters: FabricCounters,
}

// SAFETY: SegmentHeader lives in shared memory and is accessed concurrently
// from multiple processes. All runtime-mutable fields are atomics; the one
// UnsafeCell (flex_zone_checksum) is serialized by the configured spinlock,
// and a racing read of it at worst observes a digest that fails to verify.
unsafe impl Send for SegmentHeader {}
unsafe impl Sync for SegmentHeader {}

/// Canonical description of the header ABI: field name and type token, in
/// declaration order. The ABI hash is computed over this table, so any
/// reordering, retyping, or renaming of header fields changes the hash and
/// is caught at attach time.
const HEADER_ABI: &[(&str, &str)] = &[
    ("magic", "u32"),
    ("version", "u32"),
    ("creation_timestamp_ns", "u64"),
    ("secret", "u64"),
    ("slot_schema_hash", "u8[32]"),
    ("flex_schema_hash", "u8[32]"),
    ("header_abi_hash", "u8[32]"),
    ("layout_checksum", "u8[32]"),
    ("flex_zone_checksum", "u8[32]"),
    ("ring_buffer_capacity", "u32"),
    ("physical_page_size", "u32"),
    ("logical_unit_size", "u32"),
    ("flexible_zone_size", "u32"),
    ("policy", "u32"),
    ("consumer_sync_policy", "u32"),
    ("checksum_policy", "u32"),
    ("checksum_enabled", "u32"),
    ("spinlock_index", "i32"),
    ("write_index", "u64"),
    ("commit_index", "u64"),
    ("last_recovery_timestamp_ns", "u64"),
    ("producer_pid", "u32"),
    ("producer_heartbeat_ns", "u64"),
    (
        "consumers",
        "{consumer_id:u64;last_read_index:u64;heartbeat_ns:u64}[64]",
    ),
    (
        "spinlocks",
        "{owner_pid:u32;owner_tid:u32;acquired_at_ns:u64}[16]",
    ),
    ("counters", "u64[8]"),
];

/// BLAKE2b-256 of the canonical header field description.
#[must_use]
pub fn header_abi_hash() -> [u8; DIGEST_SIZE] {
    let mut text = String::with_capacity(HEADER_ABI.len() * 24);
    for (name, ty) in HEADER_ABI {
        text.push_str(name);
        text.push(':');
        text.push_str(ty);
        text.push(';');
    }
    hashing::blake2b_256(text.as_bytes())
}

/// Canonical layout-checksum input for the given values.
///
/// Order is fixed: capacity | page size | logical unit | flex size | policy
/// | consumer sync policy | checksum enabled | creation timestamp | segment
/// name hash. All integers little-endian.
#[must_use]
pub fn layout_checksum_input(
    resolved: &ResolvedConfig,
    creation_timestamp_ns: u64,
    segment_name: &str,
) -> [u8; DIGEST_SIZE] {
    let mut buf = CanonicalBuf::with_capacity(64 + DIGEST_SIZE);
    buf.put_u32(resolved.ring_buffer_capacity)
        .put_u32(resolved.physical_page_size.bytes())
        .put_u32(resolved.logical_unit_size)
        .put_u32(resolved.flexible_zone_size)
        .put_u32(resolved.policy.to_u32())
        .put_u32(resolved.consumer_sync_policy.to_u32())
        .put_u32(u32::from(resolved.checksum_enabled))
        .put_u64(creation_timestamp_ns)
        .put_bytes(&hashing::hash_name(segment_name));
    hashing::blake2b_256(buf.as_bytes())
}

impl SegmentHeader {
    /// Construct a fully initialized header value.
    #[must_use]
    pub fn new(
        resolved: &ResolvedConfig,
        secret: u64,
        segment_name: &str,
        slot_schema_hash: [u8; DIGEST_SIZE],
        flex_schema_hash: [u8; DIGEST_SIZE],
    ) -> Self {
        let creation_timestamp_ns = platform::monotonic_now_ns();
        Self {
            magic: MAGIC,
            version: VERSION,
            creation_timestamp_ns,
            secret,
            slot_schema_hash,
            flex_schema_hash,
            header_abi_hash: header_abi_hash(),
            layout_checksum: layout_checksum_input(resolved, creation_timestamp_ns, segment_name),
            flex_zone_checksum: UnsafeCell::new([0u8; DIGEST_SIZE]),
            ring_buffer_capacity: resolved.ring_buffer_capacity,
            physical_page_size: resolved.physical_page_size.bytes(),
            logical_unit_size: resolved.logical_unit_size,
            flexible_zone_size: resolved.flexible_zone_size,
            policy: resolved.policy.to_u32(),
            consumer_sync_policy: resolved.consumer_sync_policy.to_u32(),
            checksum_policy: resolved.checksum_policy.to_u32(),
            checksum_enabled: u32::from(resolved.checksum_enabled),
            spinlock_index: resolved.spinlock_index,
            _pad0: 0,
            write_index: AtomicU64::new(0),
            commit_index: AtomicU64::new(0),
            last_recovery_timestamp_ns: AtomicU64::new(0),
            producer_pid: AtomicU32::new(platform::current_pid()),
            _pad1: 0,
            producer_heartbeat_ns: AtomicU64::new(platform::monotonic_now_ns()),
            consumers: [ConsumerRecord::ZERO; MAX_CONSUMERS],
            spinlocks: [SpinlockSlot::ZERO; SPINLOCK_POOL_SIZE],
            counters: FabricCounters::ZERO,
        }
    }

    /// Decoded slot progression policy.
    pub fn data_block_policy(&self) -> Result<DataBlockPolicy> {
        DataBlockPolicy::from_u32(self.policy)
    }

    /// Decoded consumer sync policy.
    pub fn sync_policy(&self) -> Result<ConsumerSyncPolicy> {
        ConsumerSyncPolicy::from_u32(self.consumer_sync_policy)
    }

    /// Decoded checksum policy.
    pub fn checksum_policy(&self) -> Result<ChecksumPolicy> {
        ChecksumPolicy::from_u32(self.checksum_policy)
    }

    /// Recompute the layout checksum from the stored layout-defining fields.
    pub fn compute_layout_checksum(&self, segment_name: &str) -> Result<[u8; DIGEST_SIZE]> {
        let resolved = self.to_resolved()?;
        Ok(layout_checksum_input(
            &resolved,
            self.creation_timestamp_ns,
            segment_name,
        ))
    }

    /// Reconstruct the resolved configuration this segment was created with.
    pub fn to_resolved(&self) -> Result<ResolvedConfig> {
        Ok(ResolvedConfig {
            ring_buffer_capacity: self.ring_buffer_capacity,
            physical_page_size: crate::config::PageSize::from_bytes(self.physical_page_size)?,
            logical_unit_size: self.logical_unit_size,
            flexible_zone_size: self.flexible_zone_size,
            policy: self.data_block_policy()?,
            consumer_sync_policy: self.sync_policy()?,
            checksum_policy: self.checksum_policy()?,
            checksum_enabled: self.checksum_enabled != 0,
            spinlock_index: self.spinlock_index,
        })
    }

    /// Validate segment identity and layout binding: magic, version, ABI
    /// hash, layout checksum, in that order, first failure wins.
    ///
    /// This is the shared prefix of consumer attach and diagnostic attach;
    /// neither secret nor schemas are involved.
    pub fn validate_core(&self, segment_name: &str) -> Result<()> {
        if self.magic != MAGIC {
            return Err(FabricError::Incompatible {
                expected: u64::from(MAGIC),
                found: u64::from(self.magic),
            });
        }
        if self.version != VERSION {
            return Err(FabricError::Incompatible {
                expected: u64::from(VERSION),
                found: u64::from(self.version),
            });
        }
        if self.header_abi_hash != header_abi_hash() {
            return Err(FabricError::Corrupt("header ABI hash mismatch".into()));
        }
        let recomputed = self.compute_layout_checksum(segment_name)?;
        if self.layout_checksum != recomputed {
            return Err(FabricError::Corrupt("layout checksum mismatch".into()));
        }
        Ok(())
    }

    /// Validate an attach against this header.
    ///
    /// Check order is fixed and the first failure wins: magic, version, ABI
    /// hash, layout checksum, secret, optional schema hashes, optional
    /// field-by-field config match. Nothing is mutated besides the
    /// schema-mismatch counter.
    pub fn validate_attach(
        &self,
        segment_name: &str,
        secret: u64,
        expected_config: Option<&ResolvedConfig>,
        expected_slot_schema: Option<[u8; DIGEST_SIZE]>,
        expected_flex_schema: Option<[u8; DIGEST_SIZE]>,
    ) -> Result<()> {
        self.validate_core(segment_name)?;
        if self.secret != secret {
            return Err(FabricError::SecretMismatch);
        }
        if let Some(expected) = expected_slot_schema {
            if self.slot_schema_hash != expected {
                self.counters
                    .schema_mismatches
                    .fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::SchemaMismatch("slot"));
            }
        }
        if let Some(expected) = expected_flex_schema {
            if self.flex_schema_hash != expected {
                self.counters
                    .schema_mismatches
                    .fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::SchemaMismatch("flex-zone"));
            }
        }
        if let Some(cfg) = expected_config {
            self.match_layout_fields(cfg)?;
        }
        Ok(())
    }

    fn match_layout_fields(&self, cfg: &ResolvedConfig) -> Result<()> {
        let mismatch = |field: &str, expected: u64, found: u64| {
            Err(FabricError::LayoutMismatch(format!(
                "{field}: expected {expected}, segment has {found}"
            )))
        };
        if cfg.ring_buffer_capacity != self.ring_buffer_capacity {
            return mismatch(
                "ring_buffer_capacity",
                u64::from(cfg.ring_buffer_capacity),
                u64::from(self.ring_buffer_capacity),
            );
        }
        if cfg.physical_page_size.bytes() != self.physical_page_size {
            return mismatch(
                "physical_page_size",
                u64::from(cfg.physical_page_size.bytes()),
                u64::from(self.physical_page_size),
            );
        }
        if cfg.logical_unit_size != self.logical_unit_size {
            return mismatch(
                "logical_unit_size",
                u64::from(cfg.logical_unit_size),
                u64::from(self.logical_unit_size),
            );
        }
        if cfg.flexible_zone_size != self.flexible_zone_size {
            return mismatch(
                "flexible_zone_size",
                u64::from(cfg.flexible_zone_size),
                u64::from(self.flexible_zone_size),
            );
        }
        if cfg.policy.to_u32() != self.policy {
            return mismatch(
                "policy",
                u64::from(cfg.policy.to_u32()),
                u64::from(self.policy),
            );
        }
        if cfg.consumer_sync_policy.to_u32() != self.consumer_sync_policy {
            return mismatch(
                "consumer_sync_policy",
                u64::from(cfg.consumer_sync_policy.to_u32()),
                u64::from(self.consumer_sync_policy),
            );
        }
        if cfg.checksum_policy.to_u32() != self.checksum_policy {
            return mismatch(
                "checksum_policy",
                u64::from(cfg.checksum_policy.to_u32()),
                u64::from(self.checksum_policy),
            );
        }
        if u32::from(cfg.checksum_enabled) != self.checksum_enabled {
            return mismatch(
                "checksum_enabled",
                u64::from(cfg.checksum_enabled),
                u64::from(self.checksum_enabled),
            );
        }
        Ok(())
    }

    /// Read the flexible-zone checksum.
    ///
    /// A read racing a producer update may observe a torn digest; the only
    /// consequence is a failed verification, which is the detectable and
    /// recoverable outcome.
    #[must_use]
    pub fn flex_zone_checksum(&self) -> [u8; DIGEST_SIZE] {
        // SAFETY: the cell always contains a valid [u8; 32]; see the racing
        // note above for why an unsynchronized read is acceptable here.
        unsafe { std::ptr::read_volatile(self.flex_zone_checksum.get()) }
    }

    /// Store the flexible-zone checksum. Caller serializes via the
    /// configured spinlock (producer) or holds the recovery path (doctor).
    pub fn set_flex_zone_checksum(&self, digest: [u8; DIGEST_SIZE]) {
        // SAFETY: writes are serialized by the caller; concurrent readers
        // tolerate torn digests (they fail verification and retry).
        unsafe { std::ptr::write_volatile(self.flex_zone_checksum.get(), digest) }
    }

    /// Claim a free consumer-table row.
    ///
    /// Returns the row index, or `None` when the table is full. The row's
    /// heartbeat is stamped immediately so a claimed row is never mistaken
    /// for a stale one.
    pub fn claim_consumer_row(&self, consumer_id: u64, initial_read_index: u64) -> Option<usize> {
        debug_assert_ne!(consumer_id, 0);
        for (row, record) in self.consumers.iter().enumerate() {
            if record
                .consumer_id
                .compare_exchange(0, consumer_id, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                record
                    .last_read_index
                    .store(initial_read_index, Ordering::Relaxed);
                record
                    .heartbeat_ns
                    .store(platform::monotonic_now_ns(), Ordering::Release);
                return Some(row);
            }
        }
        None
    }

    /// Free a consumer-table row.
    pub fn free_consumer_row(&self, row: usize) {
        let record = &self.consumers[row];
        record.last_read_index.store(0, Ordering::Relaxed);
        record.heartbeat_ns.store(0, Ordering::Relaxed);
        record.consumer_id.store(0, Ordering::Release);
    }

    /// Stamp the recovery timestamp. Called by every recovery mutation.
    pub fn stamp_recovery(&self) {
        self.last_recovery_timestamp_ns
            .store(platform::monotonic_now_ns(), Ordering::Release);
    }

    /// Refresh the producer heartbeat.
    pub fn update_producer_heartbeat(&self) {
        self.producer_heartbeat_ns
            .store(platform::monotonic_now_ns(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataBlockConfig, PageSize};

    fn resolved() -> ResolvedConfig {
        DataBlockConfig {
            ring_buffer_capacity: Some(4),
            physical_page_size: Some(PageSize::Page4K),
            logical_unit_size: 0,
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

    fn header(name: &str) -> SegmentHeader {
        SegmentHeader::new(&resolved(), 0xC0FFEE, name, [1u8; 32], [2u8; 32])
    }

    #[test]
    fn test_header_is_one_page() {
        assert_eq!(std::mem::size_of::<SegmentHeader>(), HEADER_SIZE);
        assert_eq!(std::mem::align_of::<SegmentHeader>(), HEADER_SIZE);
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<ConsumerRecord>(), 24);
        assert_eq!(std::mem::size_of::<SpinlockSlot>(), 16);
        assert_eq!(std::mem::size_of::<FabricCounters>(), 64);
    }

    #[test]
    fn test_abi_hash_stable() {
        assert_eq!(header_abi_hash(), header_abi_hash());
        assert_ne!(header_abi_hash(), [0u8; 32]);
    }

    #[test]
    fn test_validate_attach_ok() {
        let h = header("/memfab_t1");
        h.validate_attach("/memfab_t1", 0xC0FFEE, Some(&resolved()), Some([1u8; 32]), None)
            .expect("attach should validate");
    }

    #[test]
    fn test_validate_attach_first_failure_wins() {
        let mut h = header("/memfab_t2");

        // Wrong name -> layout checksum breaks before the secret check runs.
        assert!(matches!(
            h.validate_attach("/memfab_other", 0xBAD, None, None, None),
            Err(FabricError::Corrupt(_))
        ));

        // Bad magic wins over everything.
        h.magic = 0xDEAD;
        assert!(matches!(
            h.validate_attach("/memfab_t2", 0xC0FFEE, None, None, None),
            Err(FabricError::Incompatible { .. })
        ));
    }

    #[test]
    fn test_validate_attach_secret() {
        let h = header("/memfab_t3");
        assert!(matches!(
            h.validate_attach("/memfab_t3", 0xBAD, None, None, None),
            Err(FabricError::SecretMismatch)
        ));
    }

    #[test]
    fn test_validate_attach_schema_counts() {
        let h = header("/memfab_t4");
        assert!(matches!(
            h.validate_attach("/memfab_t4", 0xC0FFEE, None, Some([9u8; 32]), None),
            Err(FabricError::SchemaMismatch("slot"))
        ));
        assert_eq!(h.counters.snapshot().schema_mismatches, 1);
    }

    #[test]
    fn test_validate_attach_config_mismatch() {
        let h = header("/memfab_t5");
        let mut other = resolved();
        other.ring_buffer_capacity = 8;
        // Capacity changes the layout checksum input too, but the expected
        // config is checked against the stored fields only after the stored
        // checksum verifies against those same stored fields.
        let err = h
            .validate_attach("/memfab_t5", 0xC0FFEE, Some(&other), None, None)
            .unwrap_err();
        assert!(matches!(err, FabricError::LayoutMismatch(_)));
        assert!(err.to_string().contains("ring_buffer_capacity"));
    }

    #[test]
    fn test_layout_checksum_binds_identity() {
        let r = resolved();
        let a = layout_checksum_input(&r, 100, "/memfab_a");
        let b = layout_checksum_input(&r, 100, "/memfab_b");
        let c = layout_checksum_input(&r, 101, "/memfab_a");
        assert_ne!(a, b); // name component
        assert_ne!(a, c); // timestamp component

        let mut r2 = r;
        r2.logical_unit_size = 512;
        assert_ne!(a, layout_checksum_input(&r2, 100, "/memfab_a"));
    }

    #[test]
    fn test_to_resolved_roundtrip() {
        let h = header("/memfab_t6");
        let r = h.to_resolved().unwrap();
        assert_eq!(r, resolved());
    }

    #[test]
    fn test_consumer_row_claim_free() {
        let h = header("/memfab_t7");
        let id = (u64::from(platform::current_pid()) << 32) | 7;
        let row = h.claim_consumer_row(id, 3).expect("row available");
        assert_eq!(h.consumers[row].consumer_id.load(Ordering::Acquire), id);
        assert_eq!(h.consumers[row].last_read_index.load(Ordering::Relaxed), 3);
        assert!(h.consumers[row].heartbeat_ns.load(Ordering::Acquire) > 0);
        assert_eq!(ConsumerRecord::pid_of(id), platform::current_pid());

        h.free_consumer_row(row);
        assert_eq!(h.consumers[row].consumer_id.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_consumer_table_exhaustion() {
        let h = header("/memfab_t8");
        for i in 0..MAX_CONSUMERS {
            assert!(h.claim_consumer_row(1 + i as u64, 0).is_some());
        }
        assert!(h.claim_consumer_row(999, 0).is_none());
    }

    #[test]
    fn test_flex_checksum_roundtrip() {
        let h = header("/memfab_t9");
        assert_eq!(h.flex_zone_checksum(), [0u8; 32]);
        h.set_flex_zone_checksum([5u8; 32]);
        assert_eq!(h.flex_zone_checksum(), [5u8; 32]);
    }
}
