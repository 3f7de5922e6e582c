//! Replication sets produced by replication windows.

use std::collections::btree_map::{self, BTreeMap};

use crate::role::NetEntityRole;
use crate::types::NetEntityHandle;

/// How a connection should replicate one entity.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityReplicationData {
    pub role: NetEntityRole,
    pub priority: f32,
}

impl EntityReplicationData {
    #[must_use]
    pub const fn new(role: NetEntityRole, priority: f32) -> Self {
        Self { role, priority }
    }
}

/// Per-connection map from entity to its replication role and priority.
///
/// Stored ordered by handle so it can be merge-walked against other
/// handle-ordered maps; consumers that need priority order use
/// [`by_priority`](Self::by_priority).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationSet {
    entries: BTreeMap<NetEntityHandle, EntityReplicationData>,
}

impl ReplicationSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an entry.
    ///
    /// Entries with [`NetEntityRole::InvalidRole`] are never stored; in debug
    /// builds inserting one is an assertion failure.
    pub fn insert(&mut self, handle: NetEntityHandle, data: EntityReplicationData) -> bool {
        debug_assert!(
            data.role.is_valid(),
            "replication set entry {handle} has no role"
        );
        if !data.role.is_valid() {
            return false;
        }
        self.entries.insert(handle, data);
        true
    }

    pub fn remove(&mut self, handle: NetEntityHandle) -> Option<EntityReplicationData> {
        self.entries.remove(&handle)
    }

    #[must_use]
    pub fn get(&self, handle: NetEntityHandle) -> Option<&EntityReplicationData> {
        self.entries.get(&handle)
    }

    #[must_use]
    pub fn contains(&self, handle: NetEntityHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterates in handle order.
    pub fn iter(&self) -> btree_map::Iter<'_, NetEntityHandle, EntityReplicationData> {
        self.entries.iter()
    }

    /// Entries sorted by descending priority, ties broken by handle.
    #[must_use]
    pub fn by_priority(&self) -> Vec<(NetEntityHandle, EntityReplicationData)> {
        let mut sorted: Vec<_> = self.entries.iter().map(|(h, d)| (*h, *d)).collect();
        sorted.sort_by(|(ha, a), (hb, b)| b.priority.total_cmp(&a.priority).then(ha.cmp(hb)));
        sorted
    }
}

impl<'a> IntoIterator for &'a ReplicationSet {
    type Item = (&'a NetEntityHandle, &'a EntityReplicationData);
    type IntoIter = btree_map::Iter<'a, NetEntityHandle, EntityReplicationData>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
