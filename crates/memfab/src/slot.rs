// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-slot read/write state machine.
//!
//! One [`SlotRwState`] per slot coordinates writers and readers across
//! processes. Structures are 64-byte aligned to prevent false sharing.
//!
//! # Memory Ordering Strategy
//!
//! - **Release** on `commit_payload`: the generation bump and the
//!   `Committed` store are publish barriers; every payload byte written
//!   before them is visible to any thread that Acquire-loads the same
//!   fields.
//! - **Acquire** on the reader side: the generation snapshot, the state
//!   check, and the `reader_count` increment all synchronize with the
//!   writer's Release stores.
//! - **Relaxed** on `last_change_ns`: diagnostic only, never used for
//!   coordination.
//!
//! # TOCTTOU double-check
//!
//! A reader snapshots the generation, checks `Committed`, increments
//! `reader_count`, then re-reads state and generation. A writer that
//! committed in between bumped the generation, so the re-read fails and
//! the reader backs out. The same exact-equality check (`validate`) runs
//! again after the reader has consumed the payload, which is what makes
//! torn reads detectable without locks.
//!
//! The writer mirrors the double-check: after storing `Writing` it
//! re-loads `reader_count`, and a reader that slipped in between the drain
//! check and the store sends it back to draining. Both re-checks are
//! SeqCst so the store/load pairs cannot miss each other; together they
//! uphold the invariant that `reader_count > 0` means no writer is
//! scribbling.
//!
//! # Generation wrap
//!
//! `write_generation` is strictly monotonic modulo 2^64 and 0 is **not** a
//! sentinel: a never-written slot is identified by `slot_state == Empty`.
//! After a wrap the in-flight reader's snapshot (`u64::MAX`) simply fails
//! the exact-equality validation.
//!
//! # Zombie reclaim
//!
//! `write_lock` holds the owning pid. When the owner is no longer alive the
//! lock is forcibly re-claimed by the next writer and the reclaim is
//! counted; the caller just sees a successful acquire.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{FabricError, Result, TimeoutKind};
use crate::header::FabricCounters;
use crate::platform;

/// On-segment size of one slot state record.
pub const SLOT_STATE_SIZE: usize = 64;

/// Bounded retries for the reader's generation double-check.
const READ_ACQUIRE_RETRIES: u32 = 3;

/// Slot lifecycle states stored in `SlotRwState::slot_state`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Never written, or reset by an abort/recovery.
    Empty = 0,
    /// A writer holds the slot and may be mutating payload bytes.
    Writing = 1,
    /// Payload is coherent as of the current generation.
    Committed = 2,
}

impl SlotState {
    /// Decode a raw state value; unknown values report as `None`.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Empty),
            1 => Some(Self::Writing),
            2 => Some(Self::Committed),
            _ => None,
        }
    }
}

/// Cross-process coordination record for one slot.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct SlotRwState {
    /// Owning writer pid; 0 = unlocked.
    pub write_lock: AtomicU32,
    /// Number of readers currently holding the slot.
    pub reader_count: AtomicU32,
    /// [`SlotState`] value.
    pub slot_state: AtomicU32,
    /// Byte length of the committed payload.
    pub payload_len: AtomicU32,
    /// Strictly monotonic (mod 2^64) per-slot write counter.
    pub write_generation: AtomicU64,
    /// Monotonic timestamp of the last state transition (diagnostics).
    pub last_change_ns: AtomicU64,
}

impl SlotRwState {
    /// Fresh slot state: `Empty`, unlocked, generation 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            write_lock: AtomicU32::new(0),
            reader_count: AtomicU32::new(0),
            slot_state: AtomicU32::new(SlotState::Empty as u32),
            payload_len: AtomicU32::new(0),
            write_generation: AtomicU64::new(0),
            last_change_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    fn touch(&self) {
        self.last_change_ns
            .store(platform::monotonic_now_ns(), Ordering::Relaxed);
    }

    /// Decoded slot state.
    #[must_use]
    pub fn state(&self) -> Option<SlotState> {
        SlotState::from_u32(self.slot_state.load(Ordering::Acquire))
    }

    /// Acquire this slot for writing.
    ///
    /// Phase 1 (lock): CAS `write_lock` from 0, reclaiming it outright when
    /// the recorded owner is dead. Phase 2 (drain): wait for `reader_count`
    /// to reach 0. Both phases share one deadline derived from a single
    /// monotonic-clock reading; `None` waits indefinitely, `Some(0)` is a
    /// single attempt. On success the slot is left in `Writing`.
    pub fn begin_write(
        &self,
        counters: &FabricCounters,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let my_pid = platform::current_pid();
        let deadline = timeout.map(|t| platform::monotonic_now_ns().saturating_add(t.as_nanos() as u64));
        let mut backoff = Backoff::new();

        // Phase 1: take the write lock. Readers do not gate this phase; a
        // slot full of readers is a drain problem, and reporting it as one
        // (WaitDrain, not WaitLock) is what tells an operator a reader is
        // stuck rather than a writer.
        loop {
            if self.write_lock.load(Ordering::Acquire) == 0
                && self
                    .write_lock
                    .compare_exchange(0, my_pid, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                break;
            }

            let owner = self.write_lock.load(Ordering::Acquire);
            if owner != 0 && owner != my_pid && !platform::is_process_alive(owner) {
                if self
                    .write_lock
                    .compare_exchange(owner, my_pid, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    counters.zombie_reclaims.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[FAB] reclaimed write lock from dead pid {owner}");
                    break;
                }
                // Someone else won the reclaim race; keep waiting.
                continue;
            }

            if deadline_elapsed(deadline) {
                counters.writer_lock_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(FabricError::Timeout(TimeoutKind::WaitLock));
            }
            backoff.wait();
        }

        // Phase 2: drain readers under the same deadline budget. Holding
        // the lock means nobody else mutates slot_state, so the pre-drain
        // value is what a failed double-check must restore.
        backoff.reset();
        let prev_state = self.slot_state.load(Ordering::Acquire);
        loop {
            while self.reader_count.load(Ordering::SeqCst) != 0 {
                if deadline_elapsed(deadline) {
                    self.write_lock.store(0, Ordering::Release);
                    counters
                        .writer_drain_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    return Err(FabricError::Timeout(TimeoutKind::WaitDrain));
                }
                backoff.wait();
            }

            self.slot_state
                .store(SlotState::Writing as u32, Ordering::SeqCst);
            if self.reader_count.load(Ordering::SeqCst) == 0 {
                break;
            }
            // A reader slipped in between the drain check and the Writing
            // store; give the slot back and drain again.
            self.slot_state.store(prev_state, Ordering::SeqCst);
        }
        self.touch();
        Ok(())
    }

    /// Commit the payload: bump the generation (invalidating any in-flight
    /// reader of the previous one), record the payload length, and publish
    /// `Committed`. The write lock is released separately with
    /// [`SlotRwState::release_lock`] after the ring index has advanced.
    ///
    /// Returns the new generation value.
    pub fn commit_payload(&self, payload_len: u32) -> u64 {
        let new_gen = self
            .write_generation
            .fetch_add(1, Ordering::Release)
            .wrapping_add(1);
        self.payload_len.store(payload_len, Ordering::Release);
        self.slot_state
            .store(SlotState::Committed as u32, Ordering::Release);
        self.touch();
        new_gen
    }

    /// Release the write lock.
    pub fn release_lock(&self) {
        self.write_lock.store(0, Ordering::Release);
    }

    /// Abort a write: restore `Empty` without bumping the generation, then
    /// unlock.
    pub fn abort_write(&self) {
        self.slot_state
            .store(SlotState::Empty as u32, Ordering::Release);
        self.touch();
        self.write_lock.store(0, Ordering::Release);
    }

    /// Acquire this slot for reading.
    ///
    /// Returns the generation snapshot carried by the read handle, or
    /// `NotReady` when the slot is not `Committed` or a writer keeps
    /// winning the double-check race.
    pub fn begin_read(&self) -> Result<u64> {
        for _ in 0..READ_ACQUIRE_RETRIES {
            let g0 = self.write_generation.load(Ordering::Acquire);
            if self.slot_state.load(Ordering::Acquire) != SlotState::Committed as u32 {
                return Err(FabricError::NotReady);
            }
            self.reader_count.fetch_add(1, Ordering::SeqCst);
            if self.slot_state.load(Ordering::SeqCst) == SlotState::Committed as u32
                && self.write_generation.load(Ordering::Acquire) == g0
            {
                self.touch();
                return Ok(g0);
            }
            // A writer started between the snapshot and the increment.
            self.reader_count.fetch_sub(1, Ordering::Release);
        }
        Err(FabricError::NotReady)
    }

    /// Exact-equality generation check. Call before trusting any bytes
    /// derived from the slot.
    #[inline]
    #[must_use]
    pub fn validate(&self, generation_snapshot: u64) -> bool {
        self.write_generation.load(Ordering::Acquire) == generation_snapshot
    }

    /// Release a read acquisition. `raced` reports whether the reader
    /// observed a failed validation, which feeds the race counter.
    pub fn end_read(&self, counters: &FabricCounters, raced: bool) {
        self.reader_count.fetch_sub(1, Ordering::Release);
        if raced {
            counters.reader_races.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
    }

    /// Committed payload length.
    #[inline]
    #[must_use]
    pub fn committed_len(&self) -> u32 {
        self.payload_len.load(Ordering::Acquire)
    }

    /// Reset coordination state without touching the generation, so
    /// in-flight readers observe staleness through validation. Recovery
    /// only.
    pub fn force_clear(&self) {
        self.slot_state
            .store(SlotState::Empty as u32, Ordering::Release);
        self.write_lock.store(0, Ordering::Release);
        self.reader_count.store(0, Ordering::Release);
        self.touch();
    }
}

impl Default for SlotRwState {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn deadline_elapsed(deadline: Option<u64>) -> bool {
    match deadline {
        Some(d) => platform::monotonic_now_ns() >= d,
        None => false,
    }
}
