// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory spinlock for non-slot coordination.
//!
//! Each segment header carries a fixed pool of [`SpinlockSlot`]s; the
//! configured `spinlock_index` selects the one guarding flexible-zone
//! mutation. Ownership is `(pid, tid)`: a lock can only be released by the
//! thread that took it, and a lock whose owning process has died is
//! reclaimed by the next waiter (counted as a zombie reclaim).
//!
//! Timeouts are measured against the monotonic clock, never wall time.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{FabricError, Result, TimeoutKind};
use crate::header::{FabricCounters, SpinlockSlot};
use crate::platform;

/// Handle to one lock in the shared pool.
#[derive(Clone, Copy)]
pub struct SharedSpinlock<'a> {
    slot: &'a SpinlockSlot,
    counters: &'a FabricCounters,
}

impl<'a> SharedSpinlock<'a> {
    /// Bind to a pool slot.
    #[must_use]
    pub fn new(slot: &'a SpinlockSlot, counters: &'a FabricCounters) -> Self {
        Self { slot, counters }
    }

    /// Acquire, waiting indefinitely.
    pub fn lock(&self) -> Result<SpinlockGuard<'a>> {
        self.acquire(None)
    }

    /// Acquire with a bounded wait. `Duration::ZERO` is a single attempt.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<SpinlockGuard<'a>> {
        self.acquire(Some(timeout))
    }

    fn acquire(&self, timeout: Option<Duration>) -> Result<SpinlockGuard<'a>> {
        let my_pid = platform::current_pid();
        let my_tid = platform::current_tid();
        let deadline =
            timeout.map(|t| platform::monotonic_now_ns().saturating_add(t.as_nanos() as u64));
        let mut backoff = Backoff::new();

        loop {
            if self
                .slot
                .owner_pid
                .compare_exchange(0, my_pid, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }

            let owner = self.slot.owner_pid.load(Ordering::Acquire);
            if owner != 0 && !platform::is_process_alive(owner) {
                if self
                    .slot
                    .owner_pid
                    .compare_exchange(owner, my_pid, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    self.counters.zombie_reclaims.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[FAB] reclaimed spinlock from dead pid {owner}");
                    break;
                }
                continue;
            }

            if let Some(d) = deadline {
                if platform::monotonic_now_ns() >= d {
                    return Err(FabricError::Timeout(TimeoutKind::Spinlock));
                }
            }
            backoff.wait();
        }

        self.slot.owner_tid.store(my_tid, Ordering::Release);
        self.slot
            .acquired_at_ns
            .store(platform::monotonic_now_ns(), Ordering::Release);
        Ok(SpinlockGuard {
            slot: self.slot,
            pid: my_pid,
            tid: my_tid,
            _not_send: std::marker::PhantomData,
        })
    }
}

/// RAII ownership of a shared spinlock; releases on drop.
///
/// Not `Send`: ownership is per-thread, and moving a guard across threads
/// would let the wrong tid unlock.
#[derive(Debug)]
pub struct SpinlockGuard<'a> {
    slot: &'a SpinlockSlot,
    pid: u32,
    tid: u32,
    _not_send: std::marker::PhantomData<*const ()>,
}

impl SpinlockGuard<'_> {
    /// True while this guard still owns the lock (a zombie reclaim by
    /// another process can revoke ownership out from under a dead holder;
    /// a live holder keeps it).
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.slot.owner_pid.load(Ordering::Acquire) == self.pid
            && self.slot.owner_tid.load(Ordering::Acquire) == self.tid
    }
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        // Unlock refuses when the holder is not the current thread: the
        // guard is !Send so pid matches, but a reclaim may have handed the
        // lock to someone else while this process was suspended.
        if self.slot.owner_tid.load(Ordering::Acquire) != self.tid
            || self.slot.owner_pid.load(Ordering::Acquire) != self.pid
        {
            log::warn!("[FAB] spinlock release skipped: no longer the owner");
            return;
        }
        self.slot.owner_tid.store(0, Ordering::Release);
        self.slot.acquired_at_ns.store(0, Ordering::Release);
        self.slot.owner_pid.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::find_dead_pid;

    fn pool_slot() -> (SpinlockSlot, FabricCounters) {
        (
            SpinlockSlot {
                owner_pid: std::sync::atomic::AtomicU32::new(0),
                owner_tid: std::sync::atomic::AtomicU32::new(0),
                acquired_at_ns: std::sync::atomic::AtomicU64::new(0),
            },
            FabricCounters::new(),
        )
    }

    #[test]
    fn test_lock_unlock_cycle() {
        let (slot, counters) = pool_slot();
        let lock = SharedSpinlock::new(&slot, &counters);

        {
            let guard = lock.lock().expect("uncontended lock");
            assert!(guard.is_held());
            assert_eq!(
                slot.owner_pid.load(Ordering::Acquire),
                platform::current_pid()
            );
            assert!(slot.acquired_at_ns.load(Ordering::Acquire) > 0);
        }
        assert_eq!(slot.owner_pid.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_try_lock_times_out_on_live_owner() {
        let (slot, counters) = pool_slot();
        // pid 1 exists and is not us.
        slot.owner_pid.store(1, Ordering::Release);

        let lock = SharedSpinlock::new(&slot, &counters);
        let err = lock.try_lock_for(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, FabricError::Timeout(TimeoutKind::Spinlock)));
        assert_eq!(slot.owner_pid.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_zombie_owner_reclaimed() {
        let (slot, counters) = pool_slot();
        slot.owner_pid.store(find_dead_pid(), Ordering::Release);
        slot.owner_tid.store(42, Ordering::Release);

        let lock = SharedSpinlock::new(&slot, &counters);
        let guard = lock
            .try_lock_for(Duration::from_millis(500))
            .expect("reclaim within timeout");
        assert!(guard.is_held());
        assert_eq!(counters.snapshot().zombie_reclaims, 1);
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        use std::sync::atomic::AtomicU64;
        use std::sync::Arc;

        struct Shared {
            slot: SpinlockSlot,
            counters: FabricCounters,
            value: AtomicU64,
        }
        let shared = Arc::new(Shared {
            slot: SpinlockSlot {
                owner_pid: std::sync::atomic::AtomicU32::new(0),
                owner_tid: std::sync::atomic::AtomicU32::new(0),
                acquired_at_ns: AtomicU64::new(0),
            },
            counters: FabricCounters::new(),
            value: AtomicU64::new(0),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let lock = SharedSpinlock::new(&shared.slot, &shared.counters);
                        let _guard = lock.lock().expect("lock");
                        // Non-atomic-looking read-modify-write under the lock.
                        let v = shared.value.load(Ordering::Relaxed);
                        shared.value.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread");
        }
        assert_eq!(shared.value.load(Ordering::Relaxed), 1000);
    }
}
