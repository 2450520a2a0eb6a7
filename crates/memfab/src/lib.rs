// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # memfab - cross-process shared-memory data exchange
//!
//! A single-host fabric for low-latency producer/consumer workflows.
//! Producers write fixed-size structured slots into a named shared-memory
//! segment; consumers attach and read slots under a defined ordering
//! policy. A sideband broker performs channel discovery at bind time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use memfab::{
//!     Consumer, ConsumerSyncPolicy, DataBlockConfig, DataBlockPolicy, PageSize, Producer,
//!     Result,
//! };
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     let config = DataBlockConfig {
//!         ring_buffer_capacity: Some(8),
//!         physical_page_size: Some(PageSize::Page4K),
//!         policy: Some(DataBlockPolicy::RingBuffer),
//!         consumer_sync_policy: Some(ConsumerSyncPolicy::FifoAll),
//!         ..DataBlockConfig::new()
//!     };
//!
//!     // Creator process
//!     let producer = Producer::create("/memfab_sensors", &config, 0xC0FFEE, None, None)?;
//!     producer.with_write(Some(Duration::from_millis(10)), |slot| {
//!         slot.write_bytes(b"sample")?;
//!         Ok(6)
//!     })?;
//!
//!     // Any other process on the host
//!     let consumer = Consumer::attach("/memfab_sensors", 0xC0FFEE, Some(&config), None, None)?;
//!     let sample = consumer.with_read(Some(Duration::from_millis(10)), |slot| {
//!         slot.payload().to_vec()
//!     })?;
//!     assert_eq!(sample, b"sample");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  Producer / Consumer handles      (typed slots, RAII, heartbeats)  |
//! +--------------------------------------------------------------------+
//! |  Ring & policies   | Slot RW state machine | Checksums | Flex zone |
//! +--------------------------------------------------------------------+
//! |  Header & layout binding    (ABI hash, layout checksum, schemas)   |
//! +--------------------------------------------------------------------+
//! |  POSIX shared memory        (shm_open / mmap, via libc)            |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Producer`] | Creates a segment and owns the write side |
//! | [`Consumer`] | Attaches, reads slots under a sync policy |
//! | [`WriteHandle`] / [`ReadHandle`] | Scoped slot capabilities, release on drop |
//! | [`Doctor`] | Diagnostics and recovery without a consumer row |
//! | [`DataBlockConfig`] | Creation-time layout and policy knobs |
//! | [`ChannelBroker`] | Bind-time discovery contract |

/// Attached-segment wrapper with raw-region accessors.
pub mod block;
/// Channel broker contract and the in-process implementation.
pub mod broker;
/// Deterministic little-endian encoding for hash inputs.
pub mod canon;
/// Slot and flexible-zone checksum lifecycle.
pub mod checksum;
/// Configuration and policy enums.
pub mod config;
/// Consumer surface.
pub mod consumer;
/// Diagnostics and recovery.
pub mod diag;
/// Error taxonomy.
pub mod error;
/// Flexible-zone access views.
pub mod flexzone;
/// BLAKE2b-256 helpers.
pub mod hashing;
/// Segment header, ABI hash, layout checksum.
pub mod header;
/// Region layout derivation.
pub mod layout;
/// Platform shim: clock, pids, liveness.
pub mod platform;
/// Producer surface.
pub mod producer;
/// Ring-buffer progression and slot selection.
pub mod ring;
/// Canonical type descriptions and schema hashing.
pub mod schema;
/// POSIX shared memory wrappers.
pub mod segment;
/// Per-slot read/write state machine.
pub mod slot;
/// Shared-memory spinlock pool.
pub mod spinlock;

mod backoff;

pub use broker::{ChannelAd, ChannelBroker, InProcBroker};
pub use config::{
    ChecksumPolicy, ConsumerSyncPolicy, DataBlockConfig, DataBlockPolicy, PageSize,
};
pub use consumer::{Consumer, ReadHandle};
pub use diag::{Doctor, ForceResetOpts, IntegrityReport, SlotDiagnostic};
pub use error::{FabricError, Result, TimeoutKind};
pub use flexzone::{FlexZone, FlexZoneMut};
pub use header::{CountersSnapshot, SegmentHeader, MAGIC, VERSION};
pub use layout::SegmentLayout;
pub use producer::{Producer, WriteHandle};
pub use schema::{FieldKind, Schema, SchemaField};
pub use segment::{scan_segments, segment_name, ShmSegment};
pub use slot::{SlotRwState, SlotState};
