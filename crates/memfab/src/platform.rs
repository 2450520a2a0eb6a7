// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Platform shim: monotonic time, process/thread identity, pid liveness.
//!
//! Everything here goes through libc directly. Two constraints drive that:
//!
//! - Timeout deadlines are stored in shared memory and compared across
//!   processes, so they must come from a clock that is meaningful in every
//!   process. `CLOCK_MONOTONIC` nanoseconds satisfy that on a single host;
//!   `std::time::Instant` is opaque and cannot be shared.
//! - Zombie reclaim needs a cheap "is this pid alive" probe. `kill(pid, 0)`
//!   performs the permission and existence checks without delivering a
//!   signal.

/// Current value of the monotonic clock in nanoseconds.
///
/// Comparable across processes on the same host (same boot). Never use
/// wall-clock time for coordination deadlines: it can jump.
#[must_use]
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec; CLOCK_MONOTONIC is always
    // available on the supported platforms. clock_gettime only writes ts.
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(ret, 0);
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Current process id.
#[inline]
#[must_use]
pub fn current_pid() -> u32 {
    // SAFETY: getpid never fails and has no preconditions.
    unsafe { libc::getpid() as u32 }
}

/// Current thread id (kernel tid, not pthread handle).
#[inline]
#[must_use]
#[cfg(target_os = "linux")]
pub fn current_tid() -> u32 {
    // SAFETY: gettid never fails and has no preconditions.
    unsafe { libc::gettid() as u32 }
}

/// Fallback thread id for non-Linux platforms: hash of the std thread id.
#[inline]
#[must_use]
#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as u32
}

/// Check whether a process with the given pid exists.
///
/// `kill(pid, 0)` returns 0 when the process exists and we may signal it,
/// and fails with `EPERM` when it exists but belongs to another user. Both
/// count as alive; only `ESRCH` means the pid is gone.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs error checking only; no signal is
    // delivered regardless of the pid value.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Find a pid that is currently not alive.
///
/// Test helper for simulating dead lock owners. Walks down from a high pid
/// until the liveness probe fails.
#[cfg(test)]
#[must_use]
pub fn find_dead_pid() -> u32 {
    let mut pid = 999_999u32;
    while is_process_alive(pid) {
        pid -= 1;
    }
    pid
}
