//! Per-connection replication configuration.

/// Bytes the transport spends on its own packet header.
pub const TRANSPORT_HEADER_BYTES: usize = 12;

/// Bytes reserved for manager-level framing overhead.
pub const REPLICATION_OVERHEAD_BYTES: usize = 16;

/// Tunables for one [`EntityReplicationManager`].
///
/// [`EntityReplicationManager`]: crate::EntityReplicationManager
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReplicationConfig {
    /// Connection MTU in bytes.
    pub connection_mtu: usize,

    /// Most entities whose creation the remote has not yet acknowledged.
    pub max_remote_entities_pending_creation: usize,

    /// How long an entity that left the window keeps its replicator before
    /// a delete is sent.
    pub entity_pending_removal_ms: u64,

    /// How long a deleted subscriber keeps rejecting stale packets before it
    /// is dropped.
    pub subscriber_removal_grace_ms: u64,

    /// Time budget for activating newly created entities per call; zero
    /// activates everything queued.
    pub entity_activation_time_slice_ms: u64,

    /// Most entity messages packed into one packet.
    pub max_messages_per_packet: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            connection_mtu: 1384,
            max_remote_entities_pending_creation: usize::MAX,
            entity_pending_removal_ms: 1000,
            subscriber_removal_grace_ms: 2000,
            entity_activation_time_slice_ms: 0,
            max_messages_per_packet: 2048,
        }
    }
}

impl ReplicationConfig {
    /// Creates a configuration with small values for tests.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            connection_mtu: 256,
            max_remote_entities_pending_creation: 64,
            entity_pending_removal_ms: 100,
            subscriber_removal_grace_ms: 200,
            entity_activation_time_slice_ms: 0,
            max_messages_per_packet: 32,
        }
    }

    /// Largest packet the manager builds, header included.
    #[must_use]
    pub const fn max_payload_bytes(&self) -> usize {
        self.connection_mtu
            .saturating_sub(TRANSPORT_HEADER_BYTES)
            .saturating_sub(REPLICATION_OVERHEAD_BYTES)
    }
}
