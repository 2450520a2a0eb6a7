// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the fabric surface.
//!
//! Errors split into two classes:
//!
//! - **Retriable**: [`FabricError::Timeout`], [`FabricError::NotReady`],
//!   [`FabricError::ChecksumFailed`]. The caller may retry the operation.
//! - **Sticky**: everything else. Retrying without operator intervention
//!   will not help (bad config, incompatible segment, corruption).

use std::fmt;
use std::io;

/// Which wait phase of a blocking acquire timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Waiting for the slot write lock.
    WaitLock,
    /// Holding the write lock, waiting for readers to drain.
    WaitDrain,
    /// Waiting for a shared spinlock.
    Spinlock,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitLock => write!(f, "wait-lock"),
            Self::WaitDrain => write!(f, "wait-drain"),
            Self::Spinlock => write!(f, "spinlock"),
        }
    }
}

/// Errors that can occur across the fabric surface.
#[derive(Debug)]
pub enum FabricError {
    /// A required configuration field is unset or a field combination is invalid.
    ConfigInvalid(String),

    /// Layout-defining fields do not match between segment and expectation.
    LayoutMismatch(String),

    /// Slot or flex-zone schema hash does not match the attached segment.
    SchemaMismatch(&'static str),

    /// Segment (or broker channel) does not exist.
    NotFound(String),

    /// A bounded wait elapsed.
    Timeout(TimeoutKind),

    /// No slot is currently readable under the configured sync policy.
    NotReady,

    /// Stored checksum does not match the slot bytes.
    ChecksumFailed {
        /// Ring index of the failing slot.
        slot: u32,
    },

    /// Magic number or version mismatch.
    Incompatible { expected: u64, found: u64 },

    /// Layout checksum or header self-description does not verify.
    Corrupt(String),

    /// A layout-defining value is outside the supported set (e.g. page size).
    Unsupported(String),

    /// Shared-secret check failed at attach.
    SecretMismatch,

    /// Segment name violates POSIX shm naming rules.
    InvalidName(String),

    /// Segment backing operation failed (shm_open, ftruncate, mmap).
    Io(io::Error),
}

impl FabricError {
    /// True for errors the caller may retry without operator intervention.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::NotReady | Self::ChecksumFailed { .. }
        )
    }
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigInvalid(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::LayoutMismatch(msg) => write!(f, "Layout mismatch: {msg}"),
            Self::SchemaMismatch(kind) => write!(f, "Schema hash mismatch for {kind} type"),
            Self::NotFound(name) => write!(f, "Not found: {name}"),
            Self::Timeout(kind) => write!(f, "Timed out during {kind}"),
            Self::NotReady => write!(f, "No slot ready to read"),
            Self::ChecksumFailed { slot } => write!(f, "Checksum verification failed for slot {slot}"),
            Self::Incompatible { expected, found } => {
                write!(f, "Incompatible segment: expected {expected:#x}, found {found:#x}")
            }
            Self::Corrupt(msg) => write!(f, "Corrupt segment: {msg}"),
            Self::Unsupported(msg) => write!(f, "Unsupported: {msg}"),
            Self::SecretMismatch => write!(f, "Shared secret does not match segment"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::Io(e) => write!(f, "Segment backing I/O failed: {e}"),
        }
    }
}

impl std::error::Error for FabricError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FabricError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Result type for fabric operations.
pub type Result<T> = std::result::Result<T, FabricError>;
