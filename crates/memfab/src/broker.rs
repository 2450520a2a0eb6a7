// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Channel broker contract.
//!
//! The sideband broker performs channel discovery and registration; its
//! wire protocol is external to this crate. The fabric only talks to it at
//! bind time: a producer registers its segment under a channel name, a
//! consumer resolves a channel name to a segment name, secret, and schema
//! identity. No steady-state traffic crosses this trait.
//!
//! [`InProcBroker`] is the in-process implementation used for same-process
//! wiring and tests.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::{FabricError, Result};
use crate::hashing::DIGEST_SIZE;

/// Everything a consumer needs to bind to a producer's segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAd {
    /// Shared-memory segment name.
    pub segment_name: String,
    /// Shared secret checked at attach.
    pub secret: u64,
    /// Schema hash of the slot payload type.
    pub slot_schema_hash: [u8; DIGEST_SIZE],
    /// Schema hash of the flexible-zone type.
    pub flex_schema_hash: [u8; DIGEST_SIZE],
    /// Producer-declared schema version.
    pub schema_version: u32,
}

/// Bind-time channel registration and discovery.
pub trait ChannelBroker {
    /// Register a producer's segment under a channel name. Re-registration
    /// of the same channel replaces the advertisement.
    fn register_producer(&self, channel: &str, ad: ChannelAd) -> Result<()>;

    /// Resolve a channel name. Fails with `NotFound` for unknown channels.
    fn discover_producer(&self, channel: &str) -> Result<ChannelAd>;
}

/// In-process broker backed by a locked map.
#[derive(Default)]
pub struct InProcBroker {
    channels: RwLock<HashMap<String, ChannelAd>>,
}

impl InProcBroker {
    /// Empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a channel advertisement.
    pub fn unregister(&self, channel: &str) {
        self.channels.write().remove(channel);
    }
}

impl ChannelBroker for InProcBroker {
    fn register_producer(&self, channel: &str, ad: ChannelAd) -> Result<()> {
        log::debug!(
            "[FAB] channel '{channel}' registered -> {}",
            ad.segment_name
        );
        self.channels.write().insert(channel.to_string(), ad);
        Ok(())
    }

    fn discover_producer(&self, channel: &str) -> Result<ChannelAd> {
        self.channels
            .read()
            .get(channel)
            .cloned()
            .ok_or_else(|| FabricError::NotFound(format!("channel '{channel}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ad(name: &str) -> ChannelAd {
        ChannelAd {
            segment_name: name.to_string(),
            secret: 42,
            slot_schema_hash: [1u8; 32],
            flex_schema_hash: [2u8; 32],
            schema_version: 3,
        }
    }

    #[test]
    fn test_register_discover_roundtrip() {
        let broker = InProcBroker::new();
        broker
            .register_producer("lab/camera", ad("/memfab_lab_camera"))
            .unwrap();

        let found = broker.discover_producer("lab/camera").unwrap();
        assert_eq!(found, ad("/memfab_lab_camera"));
    }

    #[test]
    fn test_unknown_channel_not_found() {
        let broker = InProcBroker::new();
        assert!(matches!(
            broker.discover_producer("nope"),
            Err(FabricError::NotFound(_))
        ));
    }

    #[test]
    fn test_reregistration_replaces() {
        let broker = InProcBroker::new();
        broker.register_producer("c", ad("/memfab_a")).unwrap();
        broker.register_producer("c", ad("/memfab_b")).unwrap();
        assert_eq!(
            broker.discover_producer("c").unwrap().segment_name,
            "/memfab_b"
        );
    }

    #[test]
    fn test_unregister() {
        let broker = InProcBroker::new();
        broker.register_producer("c", ad("/memfab_a")).unwrap();
        broker.unregister("c");
        assert!(broker.discover_producer("c").is_err());
    }
}
