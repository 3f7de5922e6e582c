//! Entity storage seen by the replication manager.

use std::collections::{BTreeMap, HashMap};

use schema::ComponentDef;
use wire::PrefabEntityId;

use crate::component::{NetBindComponent, ReplicatedEntity};
use crate::error::{ReplicationError, ReplicationResult};
use crate::role::NetEntityRole;
use crate::types::{EntityRegistry, NetEntityHandle};

/// The host's entity store.
///
/// The manager looks entities up by handle for every operation and never
/// keeps a reference across calls.
pub trait EntityWorld {
    fn contains(&self, handle: NetEntityHandle) -> bool;

    fn component(&self, handle: NetEntityHandle) -> Option<&dyn NetBindComponent>;

    fn component_mut(&mut self, handle: NetEntityHandle) -> Option<&mut dyn NetBindComponent>;

    /// Creates an inactive entity from a prefab, under the remote's handle.
    fn create_entity(
        &mut self,
        handle: NetEntityHandle,
        prefab: PrefabEntityId,
        role: NetEntityRole,
    ) -> ReplicationResult<()>;

    fn is_active(&self, handle: NetEntityHandle) -> bool;

    /// Activates a created entity. Returns `false` if it is not ready yet.
    fn activate_entity(&mut self, handle: NetEntityHandle) -> bool;

    fn remove_entity(&mut self, handle: NetEntityHandle);
}

#[derive(Debug, Clone)]
struct Slot {
    state: ReplicatedEntity,
    active: bool,
}

/// In-memory [`EntityWorld`] backed by [`ReplicatedEntity`] state.
///
/// Prefabs map a prefab id to the component layout its entities use.
#[derive(Debug, Default)]
pub struct LocalWorld {
    registry: EntityRegistry,
    prefabs: HashMap<u32, ComponentDef>,
    entities: BTreeMap<NetEntityHandle, Slot>,
}

impl LocalWorld {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_prefab(&mut self, prefab_id: u32, def: ComponentDef) {
        self.prefabs.insert(prefab_id, def);
    }

    /// Spawns an active, locally owned entity.
    pub fn spawn(
        &mut self,
        prefab: PrefabEntityId,
        role: NetEntityRole,
    ) -> ReplicationResult<NetEntityHandle> {
        let handle = self.registry.allocate();
        let Some(def) = self.prefabs.get(&prefab.prefab_id) else {
            self.registry.release(handle);
            return Err(ReplicationError::EntityCreateFailed {
                entity: handle,
                prefab,
            });
        };
        let state = ReplicatedEntity::new(def.clone(), prefab, role);
        self.entities.insert(handle, Slot { state, active: true });
        Ok(handle)
    }

    #[must_use]
    pub fn entity(&self, handle: NetEntityHandle) -> Option<&ReplicatedEntity> {
        self.entities.get(&handle).map(|slot| &slot.state)
    }

    pub fn entity_mut(&mut self, handle: NetEntityHandle) -> Option<&mut ReplicatedEntity> {
        self.entities.get_mut(&handle).map(|slot| &mut slot.state)
    }

    pub fn handles(&self) -> impl Iterator<Item = NetEntityHandle> + '_ {
        self.entities.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl EntityWorld for LocalWorld {
    fn contains(&self, handle: NetEntityHandle) -> bool {
        self.entities.contains_key(&handle)
    }

    fn component(&self, handle: NetEntityHandle) -> Option<&dyn NetBindComponent> {
        self.entities
            .get(&handle)
            .map(|slot| &slot.state as &dyn NetBindComponent)
    }

    fn component_mut(&mut self, handle: NetEntityHandle) -> Option<&mut dyn NetBindComponent> {
        self.entities
            .get_mut(&handle)
            .map(|slot| &mut slot.state as &mut dyn NetBindComponent)
    }

    fn create_entity(
        &mut self,
        handle: NetEntityHandle,
        prefab: PrefabEntityId,
        role: NetEntityRole,
    ) -> ReplicationResult<()> {
        let Some(def) = self.prefabs.get(&prefab.prefab_id) else {
            return Err(ReplicationError::EntityCreateFailed {
                entity: handle,
                prefab,
            });
        };
        if !self.registry.adopt(handle) {
            return Err(ReplicationError::EntityCreateFailed {
                entity: handle,
                prefab,
            });
        }
        let state = ReplicatedEntity::new(def.clone(), prefab, role);
        self.entities.insert(
            handle,
            Slot {
                state,
                active: false,
            },
        );
        Ok(())
    }

    fn is_active(&self, handle: NetEntityHandle) -> bool {
        self.entities.get(&handle).is_some_and(|slot| slot.active)
    }

    fn activate_entity(&mut self, handle: NetEntityHandle) -> bool {
        match self.entities.get_mut(&handle) {
            Some(slot) => {
                slot.active = true;
                true
            }
            None => false,
        }
    }

    fn remove_entity(&mut self, handle: NetEntityHandle) {
        if self.entities.remove(&handle).is_some() {
            self.registry.release(handle);
        }
    }
}
