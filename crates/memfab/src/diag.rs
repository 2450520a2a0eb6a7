// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Diagnostic and recovery surface.
//!
//! A [`Doctor`] attaches to a segment without allocating a consumer-table
//! row and without moving any ring index: "read-only" in the coordination
//! sense. Its mutations are confined to coordination state (locks, reader
//! counts, consumer rows) and stored checksums of current bytes. Recovery
//! never fabricates payload data.
//!
//! Forced operations require an explicit `force` flag and are documented
//! as destructive. Every recovery mutation stamps
//! `last_recovery_timestamp_ns` in the header.

use std::sync::atomic::Ordering;

use crate::block::DataBlock;
use crate::checksum;
use crate::error::{FabricError, Result};
use crate::header::{ConsumerRecord, CountersSnapshot, SegmentHeader};
use crate::layout::SegmentLayout;
use crate::platform;
use crate::slot::SlotState;

/// Point-in-time view of one slot's coordination state.
#[derive(Debug, Clone, Copy)]
pub struct SlotDiagnostic {
    /// Ring index of the slot.
    pub index: u32,
    /// Decoded state; `None` for a corrupt state value.
    pub state: Option<SlotState>,
    /// Pid in the write lock (0 = unlocked).
    pub write_lock_pid: u32,
    /// Whether that pid is currently alive.
    pub writer_alive: bool,
    /// Active reader count.
    pub reader_count: u32,
    /// Current write generation.
    pub generation: u64,
    /// Committed payload length.
    pub payload_len: u32,
    /// Best-effort time since the last state transition.
    pub stuck_duration_ns: u64,
}

impl SlotDiagnostic {
    /// A slot is suspect when a dead process holds its lock.
    #[must_use]
    pub fn has_zombie_writer(&self) -> bool {
        self.write_lock_pid != 0 && !self.writer_alive
    }
}

/// Options for [`Doctor::force_reset_slot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForceResetOpts {
    /// Reset even while the slot appears busy (locked or being read).
    pub force: bool,
}

/// Result of [`Doctor::validate_integrity`].
#[derive(Debug, Clone, Default)]
pub struct IntegrityReport {
    /// Identity and layout binding verified (magic, version, ABI hash,
    /// layout checksum).
    pub core_ok: bool,
    /// Flexible-zone checksum matched (true when checksums are disabled or
    /// no zone is configured).
    pub flex_ok: bool,
    /// Committed slots whose stored checksum did not match their bytes.
    pub bad_slots: Vec<u32>,
    /// Checksums recomputed and stored by this run (`repair = true`).
    pub repaired: u32,
}

impl IntegrityReport {
    /// True when nothing was found wrong.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.core_ok && self.flex_ok && self.bad_slots.is_empty()
    }
}

/// Diagnostic handle over one segment.
pub struct Doctor {
    block: DataBlock,
}

impl Doctor {
    /// Attach for diagnosis. No consumer row is allocated and no ring
    /// index moves; identity and layout binding are validated before any
    /// state is interpreted.
    pub fn attach(name: &str) -> Result<Self> {
        let block = DataBlock::attach(name)?;
        Ok(Self { block })
    }

    /// Segment header (read access for inspection tools).
    #[must_use]
    pub fn header(&self) -> &SegmentHeader {
        self.block.header()
    }

    /// Region layout.
    #[must_use]
    pub fn layout(&self) -> &SegmentLayout {
        self.block.layout()
    }

    /// Shared counter snapshot.
    #[must_use]
    pub fn counters(&self) -> CountersSnapshot {
        self.block.counters().snapshot()
    }

    /// Diagnose one slot.
    pub fn diagnose_slot(&self, index: u32) -> Result<SlotDiagnostic> {
        self.check_index(index)?;
        let state = self.block.slot_state(index);
        let write_lock_pid = state.write_lock.load(Ordering::Acquire);
        let last_change = state.last_change_ns.load(Ordering::Relaxed);
        let now = platform::monotonic_now_ns();
        Ok(SlotDiagnostic {
            index,
            state: state.state(),
            write_lock_pid,
            writer_alive: write_lock_pid != 0 && platform::is_process_alive(write_lock_pid),
            reader_count: state.reader_count.load(Ordering::Acquire),
            generation: state.write_generation.load(Ordering::Acquire),
            payload_len: state.committed_len(),
            stuck_duration_ns: if last_change == 0 {
                0
            } else {
                now.saturating_sub(last_change)
            },
        })
    }

    /// Diagnose every slot.
    pub fn diagnose_all_slots(&self) -> Result<Vec<SlotDiagnostic>> {
        (0..self.block.layout().slot_count)
            .map(|i| self.diagnose_slot(i))
            .collect()
    }

    /// Reset a slot's coordination state to `Empty`/unlocked/no-readers.
    ///
    /// Refuses a busy slot (held lock or active readers) unless
    /// `opts.force`. The write generation is never touched, so in-flight
    /// readers observe staleness through validation.
    pub fn force_reset_slot(&self, index: u32, opts: ForceResetOpts) -> Result<()> {
        self.check_index(index)?;
        let state = self.block.slot_state(index);
        let busy = state.write_lock.load(Ordering::Acquire) != 0
            || state.reader_count.load(Ordering::Acquire) != 0;
        if busy && !opts.force {
            return Err(FabricError::ConfigInvalid(format!(
                "slot {index} is busy; pass force to reset anyway"
            )));
        }
        state.force_clear();
        self.block.header().stamp_recovery();
        log::warn!("[FAB] slot {index} force-reset on {}", self.block.name());
        Ok(())
    }

    /// Clear the write lock of slot `index` if its holder is dead.
    ///
    /// Returns whether a lock was released. Counted as a zombie reclaim.
    pub fn release_zombie_writer(&self, index: u32) -> Result<bool> {
        self.check_index(index)?;
        let state = self.block.slot_state(index);
        let owner = state.write_lock.load(Ordering::Acquire);
        if owner == 0 || platform::is_process_alive(owner) {
            return Ok(false);
        }
        if state
            .write_lock
            .compare_exchange(owner, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Lost the race to a writer reclaiming it for itself.
            return Ok(false);
        }
        self.block
            .counters()
            .zombie_reclaims
            .fetch_add(1, Ordering::Relaxed);
        self.block.header().stamp_recovery();
        log::warn!(
            "[FAB] released write lock of slot {index} held by dead pid {owner}"
        );
        Ok(true)
    }

    /// Zero the reader count of slot `index`. Destructive: any reader that
    /// is actually alive loses its acquisition accounting, which is why
    /// `force` is mandatory.
    pub fn release_zombie_readers(&self, index: u32, force: bool) -> Result<u32> {
        self.check_index(index)?;
        if !force {
            return Err(FabricError::ConfigInvalid(
                "release_zombie_readers is destructive; pass force".into(),
            ));
        }
        let state = self.block.slot_state(index);
        let previous = state.reader_count.swap(0, Ordering::AcqRel);
        if previous != 0 {
            self.block
                .counters()
                .zombie_reclaims
                .fetch_add(1, Ordering::Relaxed);
        }
        self.block.header().stamp_recovery();
        log::warn!(
            "[FAB] cleared {previous} reader(s) on slot {index} of {}",
            self.block.name()
        );
        Ok(previous)
    }

    /// Sweep the consumer table.
    ///
    /// Frees rows whose pid is dead, and rows whose heartbeat is older than
    /// `stale_ns`. A row that never heartbeated (zero timestamp, a crash
    /// between claim and first stamp) is freed only on a dead pid.
    pub fn cleanup_dead_consumers(&self, stale_ns: u64) -> usize {
        let header = self.block.header();
        let now = platform::monotonic_now_ns();
        let mut freed = 0;

        for (row, record) in header.consumers.iter().enumerate() {
            let id = record.consumer_id.load(Ordering::Acquire);
            if id == 0 {
                continue;
            }
            let pid = ConsumerRecord::pid_of(id);
            let heartbeat = record.heartbeat_ns.load(Ordering::Acquire);

            let dead = !platform::is_process_alive(pid);
            let stale = heartbeat != 0 && now.saturating_sub(heartbeat) > stale_ns;
            if !(dead || stale) {
                continue;
            }

            // Only evict the row we inspected; a concurrent re-claim wins.
            if record
                .consumer_id
                .compare_exchange(id, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                record.last_read_index.store(0, Ordering::Relaxed);
                record.heartbeat_ns.store(0, Ordering::Relaxed);
                header
                    .counters
                    .consumer_evictions
                    .fetch_add(1, Ordering::Relaxed);
                freed += 1;
                log::info!(
                    "[FAB] evicted consumer {id:#x} (row {row}, pid {pid}, {})",
                    if dead { "dead" } else { "stale" }
                );
            }
        }

        if freed > 0 {
            header.stamp_recovery();
        }
        freed
    }

    /// Verify segment integrity; optionally repair checksums.
    ///
    /// Checks identity and layout binding, then (when checksums are
    /// enabled) the flexible-zone digest and the digest of every
    /// `Committed` slot. With `repair = true`, mismatched digests are
    /// recomputed over the **current** bytes and stored; payload data is
    /// never altered. Repair is idempotent: a second run reports clean.
    pub fn validate_integrity(&self, repair: bool) -> Result<IntegrityReport> {
        let header = self.block.header();
        let mut report = IntegrityReport::default();

        header.validate_core(self.block.name())?;
        report.core_ok = true;

        // Digest validation only applies where digests are maintained
        // automatically; under Manual the caller owns their lifecycle.
        if header.checksum_enabled == 0 || !checksum::auto_update(header.checksum_policy()?) {
            report.flex_ok = true;
            return Ok(report);
        }

        report.flex_ok = self.block.layout().flex_zone_size == 0
            || checksum::verify_flex(&self.block);
        if !report.flex_ok {
            header.counters.stale_checksums.fetch_add(1, Ordering::Relaxed);
            if repair {
                checksum::update_flex(&self.block);
                report.repaired += 1;
                report.flex_ok = true;
            }
        }

        for index in 0..self.block.layout().slot_count {
            let state = self.block.slot_state(index);
            if state.state() != Some(SlotState::Committed) {
                continue;
            }
            let len = state.committed_len() as usize;
            if checksum::verify_slot(&self.block, index, len) {
                continue;
            }
            header.counters.stale_checksums.fetch_add(1, Ordering::Relaxed);
            if repair {
                checksum::update_slot(&self.block, index, len);
                report.repaired += 1;
            } else {
                report.bad_slots.push(index);
            }
        }

        if repair {
            header.stamp_recovery();
            log::info!(
                "[FAB] integrity repair on {}: {} checksum(s) recomputed",
                self.block.name(),
                report.repaired
            );
        }
        Ok(report)
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.block.layout().slot_count {
            return Err(FabricError::ConfigInvalid(format!(
                "slot index {index} out of range (capacity {})",
                self.block.layout().slot_count
            )));
        }
        Ok(())
    }
}
