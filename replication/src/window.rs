//! Replication window policy interface.

use crate::role::NetEntityRole;
use crate::set::ReplicationSet;
use crate::types::NetEntityHandle;

/// Decides which entities one connection replicates, in what role, and at
/// what priority.
///
/// A window is owned by one connection's [`EntityReplicationManager`] and
/// injected when the connection is set up.
///
/// [`EntityReplicationManager`]: crate::EntityReplicationManager
pub trait ReplicationWindow {
    /// Returns `true` when a set computed since the last poll is available,
    /// including one computed by [`update_window`](Self::update_window).
    ///
    /// Implementations may rate-limit recomputation behind this poll.
    fn replication_set_update_ready(&mut self) -> bool;

    /// The current set. Callers should wait for the first
    /// [`replication_set_update_ready`](Self::replication_set_update_ready)
    /// before relying on it; before that it is empty.
    fn replication_set(&self) -> &ReplicationSet;

    /// Most proxy entities the manager may serialize per tick.
    fn max_entity_replicator_send_count(&self) -> u32;

    /// Point query: the entity's role if it is currently in the window.
    fn is_in_window(&self, handle: NetEntityHandle) -> Option<NetEntityRole>;

    /// Recomputes the set immediately.
    fn update_window(&mut self);

    /// Diagnostic hook, no behavioral contract.
    fn debug_draw(&self) {}
}

/// A window that never contains anything.
///
/// Used by hosts that only answer a remote authority: no entities are
/// proactively replicated, while autonomous traffic for entities the remote
/// gave us control over still flows.
#[derive(Debug, Default)]
pub struct NullReplicationWindow {
    set: ReplicationSet,
}

impl NullReplicationWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicationWindow for NullReplicationWindow {
    fn replication_set_update_ready(&mut self) -> bool {
        false
    }

    fn replication_set(&self) -> &ReplicationSet {
        &self.set
    }

    fn max_entity_replicator_send_count(&self) -> u32 {
        0
    }

    fn is_in_window(&self, _handle: NetEntityHandle) -> Option<NetEntityRole> {
        None
    }

    fn update_window(&mut self) {}
}
