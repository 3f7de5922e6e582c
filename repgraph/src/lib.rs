//! Replication windows: decide what a connection sees, not how it is sent.
//!
//! A host keeps one [`SpatialIndex`] of entity positions and shares it with
//! every connection's window. [`SpatialReplicationWindow`] keeps entities
//! within a view radius and prioritizes them by distance.
//! [`AlwaysAllReplicationWindow`] replicates every indexed entity. Both plug
//! into `replication::EntityReplicationManager::set_replication_window`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use replication::{
    EntityReplicationData, NetEntityHandle, NetEntityRole, ReplicationSet, ReplicationWindow,
};

/// Basic 3D vector for spatial queries.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn distance_sq(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    #[must_use]
    pub fn distance(self, other: Self) -> f32 {
        self.distance_sq(other).sqrt()
    }
}

/// Where a connection looks from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowView {
    pub position: Vec3,
    pub radius: f32,
}

impl WindowView {
    #[must_use]
    pub const fn new(position: Vec3, radius: f32) -> Self {
        Self { position, radius }
    }
}

/// Window limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Most proxy entities the manager may serialize per tick.
    pub max_entity_replicator_send_count: u32,
    /// Polls between recomputations of the set.
    pub update_interval_ticks: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_entity_replicator_send_count: 128,
            update_interval_ticks: 4,
        }
    }
}

impl WindowConfig {
    /// Recomputes on every poll with small caps.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            max_entity_replicator_send_count: 8,
            update_interval_ticks: 1,
        }
    }

    #[must_use]
    pub const fn unlimited() -> Self {
        Self {
            max_entity_replicator_send_count: u32::MAX,
            update_interval_ticks: 1,
        }
    }
}

/// Positions of the host's networked entities.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    max_entities: usize,
    entities: BTreeMap<NetEntityHandle, Vec3>,
}

/// A [`SpatialIndex`] shared between the host and its windows.
pub type SharedSpatialIndex = Rc<RefCell<SpatialIndex>>;

impl SpatialIndex {
    #[must_use]
    pub const fn new(max_entities: usize) -> Self {
        Self {
            max_entities,
            entities: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn shared(max_entities: usize) -> SharedSpatialIndex {
        Rc::new(RefCell::new(Self::new(max_entities)))
    }

    /// Adds or moves an entity. New entities past the cap are ignored.
    pub fn update_entity(&mut self, handle: NetEntityHandle, position: Vec3) {
        if self.entities.len() >= self.max_entities && !self.entities.contains_key(&handle) {
            log::debug!("spatial index full, not tracking {handle}");
            return;
        }
        self.entities.insert(handle, position);
    }

    pub fn remove_entity(&mut self, handle: NetEntityHandle) {
        self.entities.remove(&handle);
    }

    #[must_use]
    pub fn position(&self, handle: NetEntityHandle) -> Option<Vec3> {
        self.entities.get(&handle).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetEntityHandle, Vec3)> + '_ {
        self.entities.iter().map(|(handle, position)| (*handle, *position))
    }
}

/// Priority of an entity `distance` away from the view. Strictly
/// decreasing with distance, 1.0 at the view position.
#[must_use]
pub fn distance_priority(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Window with spatial relevance.
///
/// Entities farther than the view radius are left out. The controlled
/// entity is always in the set as an autonomous proxy with the highest
/// possible priority, and while it is indexed the view is centered on it.
/// Recomputation is rate limited to every `update_interval_ticks` polls;
/// [`set_view`](Self::set_view) forces the next poll to recompute. A set
/// computed by `update_window` is reported by the next poll.
#[derive(Debug, Clone)]
pub struct SpatialReplicationWindow {
    config: WindowConfig,
    view: WindowView,
    controlled: Option<NetEntityHandle>,
    index: SharedSpatialIndex,
    set: ReplicationSet,
    ticks_since_update: u32,
    dirty: bool,
    pending: bool,
}

impl SpatialReplicationWindow {
    #[must_use]
    pub fn new(config: WindowConfig, view: WindowView, index: SharedSpatialIndex) -> Self {
        Self {
            config,
            view,
            controlled: None,
            index,
            set: ReplicationSet::new(),
            ticks_since_update: 0,
            dirty: true,
            pending: false,
        }
    }

    #[must_use]
    pub const fn view(&self) -> WindowView {
        self.view
    }

    pub fn set_view(&mut self, view: WindowView) {
        self.view = view;
        self.dirty = true;
    }

    #[must_use]
    pub const fn controlled_entity(&self) -> Option<NetEntityHandle> {
        self.controlled
    }

    /// Sets the entity the remote controls.
    #[must_use]
    pub fn with_controlled_entity(mut self, handle: NetEntityHandle) -> Self {
        self.controlled = Some(handle);
        self.dirty = true;
        self
    }

    pub fn set_controlled_entity(&mut self, handle: Option<NetEntityHandle>) {
        self.controlled = handle;
        self.dirty = true;
    }

    fn recompute(&mut self) {
        let index = self.index.borrow();
        let center = self
            .controlled
            .and_then(|handle| index.position(handle))
            .unwrap_or(self.view.position);
        self.view.position = center;
        let radius_sq = self.view.radius * self.view.radius;

        self.set.clear();
        for (handle, position) in index.iter() {
            if Some(handle) == self.controlled {
                continue;
            }
            let distance_sq = position.distance_sq(center);
            if distance_sq > radius_sq {
                continue;
            }
            self.set.insert(
                handle,
                EntityReplicationData::new(
                    NetEntityRole::SimulatedProxy,
                    distance_priority(distance_sq.sqrt()),
                ),
            );
        }
        drop(index);
        if let Some(controlled) = self.controlled {
            self.set.insert(
                controlled,
                EntityReplicationData::new(NetEntityRole::AutonomousProxy, f32::MAX),
            );
        }
        self.ticks_since_update = 0;
        self.dirty = false;
        self.pending = true;
    }
}

impl ReplicationWindow for SpatialReplicationWindow {
    fn replication_set_update_ready(&mut self) -> bool {
        self.ticks_since_update = self.ticks_since_update.saturating_add(1);
        if self.dirty || self.ticks_since_update >= self.config.update_interval_ticks {
            self.recompute();
        }
        std::mem::take(&mut self.pending)
    }

    fn replication_set(&self) -> &ReplicationSet {
        &self.set
    }

    fn max_entity_replicator_send_count(&self) -> u32 {
        self.config.max_entity_replicator_send_count
    }

    fn is_in_window(&self, handle: NetEntityHandle) -> Option<NetEntityRole> {
        self.set.get(handle).map(|data| data.role)
    }

    fn update_window(&mut self) {
        self.recompute();
    }

    fn debug_draw(&self) {
        log::debug!(
            "spatial window at ({}, {}, {}) radius {}: {} of {} entities",
            self.view.position.x,
            self.view.position.y,
            self.view.position.z,
            self.view.radius,
            self.set.len(),
            self.index.borrow().len()
        );
        for (handle, data) in &self.set {
            log::trace!("  {handle}: {} priority {}", data.role, data.priority);
        }
    }
}

/// Window that replicates every indexed entity at equal priority.
///
/// Useful for small sessions and server-to-server links.
#[derive(Debug, Clone)]
pub struct AlwaysAllReplicationWindow {
    max_send_count: u32,
    controlled: Option<NetEntityHandle>,
    index: SharedSpatialIndex,
    set: ReplicationSet,
    pending: bool,
}

impl AlwaysAllReplicationWindow {
    #[must_use]
    pub fn new(max_send_count: u32, index: SharedSpatialIndex) -> Self {
        Self {
            max_send_count,
            controlled: None,
            index,
            set: ReplicationSet::new(),
            pending: false,
        }
    }

    pub fn set_controlled_entity(&mut self, handle: Option<NetEntityHandle>) {
        self.controlled = handle;
    }

    fn recompute(&mut self) -> bool {
        let mut next = ReplicationSet::new();
        for (handle, _) in self.index.borrow().iter() {
            let role = if Some(handle) == self.controlled {
                NetEntityRole::AutonomousProxy
            } else {
                NetEntityRole::SimulatedProxy
            };
            next.insert(handle, EntityReplicationData::new(role, 1.0));
        }
        let changed = next != self.set;
        self.set = next;
        changed
    }
}

impl ReplicationWindow for AlwaysAllReplicationWindow {
    /// Ready whenever the indexed entities changed since the last poll, or
    /// `update_window` computed a set the manager has not seen.
    fn replication_set_update_ready(&mut self) -> bool {
        let changed = self.recompute();
        changed | std::mem::take(&mut self.pending)
    }

    fn replication_set(&self) -> &ReplicationSet {
        &self.set
    }

    fn max_entity_replicator_send_count(&self) -> u32 {
        self.max_send_count
    }

    fn is_in_window(&self, handle: NetEntityHandle) -> Option<NetEntityRole> {
        self.set.get(handle).map(|data| data.role)
    }

    fn update_window(&mut self) {
        self.recompute();
        self.pending = true;
    }

    fn debug_draw(&self) {
        log::debug!("always-all window: {} entities", self.set.len());
    }
}
