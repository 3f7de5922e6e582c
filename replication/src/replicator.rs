//! Per-entity, per-connection replication state.

use bitstream::WriteSerializer;
use wire::{EntityUpdateMessage, PacketId, PrefabEntityId};

use crate::component::NetBindComponent;
use crate::error::{PropertyError, ReplicationError, ReplicationResult};
use crate::publisher::{PreparedUpdate, PropertyPublisher};
use crate::role::NetEntityRole;
use crate::subscriber::PropertySubscriber;
use crate::types::{NetEntityHandle, TimeMs};

/// One serialized entity message, owned until it is packed into a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundUpdate {
    pub handle: NetEntityHandle,
    pub network_role: NetEntityRole,
    pub is_delete: bool,
    pub was_migrated: bool,
    pub prefab: Option<PrefabEntityId>,
    pub data: Vec<u8>,
}

impl OutboundUpdate {
    /// Borrowed wire form.
    #[must_use]
    pub fn message(&self) -> EntityUpdateMessage<'_> {
        let message = if self.is_delete {
            EntityUpdateMessage::delete(
                self.handle.raw(),
                self.network_role.to_raw(),
                self.was_migrated,
            )
        } else {
            EntityUpdateMessage::update(self.handle.raw(), self.network_role.to_raw(), &self.data)
        };
        match self.prefab {
            Some(prefab) => message.with_prefab(prefab),
            None => message,
        }
    }
}

/// Replication state for one entity on one connection.
///
/// A replicator publishes when the remote does not own the entity (or when
/// this host is the controlling autonomous proxy) and subscribes when the
/// remote is the authority or the controlling proxy.
#[derive(Debug, Clone)]
pub struct EntityReplicator {
    handle: NetEntityHandle,
    bound_local_role: NetEntityRole,
    remote_role: NetEntityRole,
    priority: f32,
    prefab: Option<PrefabEntityId>,
    publisher: Option<PropertyPublisher>,
    subscriber: Option<PropertySubscriber>,
    pending_removal: Option<TimeMs>,
    was_migrated: bool,
}

impl EntityReplicator {
    #[must_use]
    pub fn new(
        handle: NetEntityHandle,
        bound_local_role: NetEntityRole,
        remote_role: NetEntityRole,
    ) -> Self {
        let mut replicator = Self {
            handle,
            bound_local_role,
            remote_role,
            priority: 0.0,
            prefab: None,
            publisher: None,
            subscriber: None,
            pending_removal: None,
            was_migrated: false,
        };
        replicator.attach();
        replicator
    }

    fn attach(&mut self) {
        let publishes = self.remote_role != NetEntityRole::Authority
            || self.bound_local_role == NetEntityRole::AutonomousProxy;
        self.publisher = publishes.then(|| {
            if self.remote_role == NetEntityRole::Authority {
                PropertyPublisher::established()
            } else {
                PropertyPublisher::new()
            }
        });
        let subscribes = matches!(
            self.remote_role,
            NetEntityRole::Authority | NetEntityRole::AutonomousProxy
        );
        self.subscriber = subscribes.then(|| PropertySubscriber::new(self.handle));
    }

    /// Rebuilds publisher and subscriber for a new remote role.
    pub fn reset(&mut self, remote_role: NetEntityRole) {
        log::debug!(
            "entity {}: resetting replicator {} -> {}",
            self.handle,
            self.remote_role,
            remote_role
        );
        self.remote_role = remote_role;
        self.pending_removal = None;
        self.attach();
    }

    #[must_use]
    pub const fn handle(&self) -> NetEntityHandle {
        self.handle
    }

    #[must_use]
    pub const fn remote_role(&self) -> NetEntityRole {
        self.remote_role
    }

    #[must_use]
    pub const fn bound_local_role(&self) -> NetEntityRole {
        self.bound_local_role
    }

    #[must_use]
    pub const fn priority(&self) -> f32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: f32) {
        self.priority = priority;
    }

    /// Prefab the remote created the entity from, once known.
    #[must_use]
    pub const fn prefab_entity_id(&self) -> Option<PrefabEntityId> {
        self.prefab
    }

    pub fn set_prefab_entity_id(&mut self, prefab: PrefabEntityId) {
        self.prefab = Some(prefab);
    }

    #[must_use]
    pub const fn publisher(&self) -> Option<&PropertyPublisher> {
        self.publisher.as_ref()
    }

    pub fn publisher_mut(&mut self) -> Option<&mut PropertyPublisher> {
        self.publisher.as_mut()
    }

    #[must_use]
    pub const fn subscriber(&self) -> Option<&PropertySubscriber> {
        self.subscriber.as_ref()
    }

    pub fn subscriber_mut(&mut self) -> Option<&mut PropertySubscriber> {
        self.subscriber.as_mut()
    }

    /// Only the authority decides when a replicator goes away.
    #[must_use]
    pub fn owns_replicator_lifetime(&self) -> bool {
        self.bound_local_role == NetEntityRole::Authority
    }

    /// Whether a delete has been requested for the remote.
    #[must_use]
    pub fn is_marked_for_removal(&self) -> bool {
        self.publisher.as_ref().is_some_and(PropertyPublisher::is_deleting)
    }

    pub fn set_pending_removal(&mut self, deadline: TimeMs) {
        if self.pending_removal.is_none() {
            self.pending_removal = Some(deadline);
        }
    }

    pub fn clear_pending_removal(&mut self) {
        self.pending_removal = None;
    }

    #[must_use]
    pub const fn pending_removal_deadline(&self) -> Option<TimeMs> {
        self.pending_removal
    }

    /// Whether the entity left this connection because its authority moved
    /// to another host.
    #[must_use]
    pub const fn was_migrated(&self) -> bool {
        self.was_migrated
    }

    pub fn set_was_migrated(&mut self, was_migrated: bool) {
        self.was_migrated = was_migrated;
    }

    /// Queues a delete for the remote.
    pub fn mark_for_removal(&mut self) {
        self.pending_removal = None;
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.set_deleting();
        }
    }

    /// Whether there is something to send this tick. Collects the
    /// component's dirty properties first.
    pub fn requires_serialization(&mut self, component: Option<&mut dyn NetBindComponent>) -> bool {
        let Some(publisher) = self.publisher.as_mut() else {
            return false;
        };
        if let Some(component) = component {
            if !publisher.is_deleting() {
                publisher.collect_dirty(&*component);
            }
        } else if !publisher.is_deleting() && self.bound_local_role == NetEntityRole::Authority {
            // The entity is gone locally; tell the remote.
            publisher.set_deleting();
        }
        publisher.requires_serialization()
    }

    /// Serializes the next message for this entity.
    pub fn generate_update(
        &mut self,
        component: Option<&mut dyn NetBindComponent>,
    ) -> ReplicationResult<OutboundUpdate> {
        let entity = self.handle;
        let Some(publisher) = self.publisher.as_mut() else {
            return Err(ReplicationError::UnexpectedUpdate {
                entity,
                reason: "replicator does not publish",
            });
        };
        let full_mask = component
            .as_ref()
            .map_or_else(Default::default, |c| c.full_mask());
        let prepared = match component {
            Some(_) => publisher.prepare_update(full_mask),
            None => {
                publisher.set_deleting();
                publisher.prepare_update(full_mask)
            }
        };

        let mut update = OutboundUpdate {
            handle: entity,
            network_role: self.remote_role,
            is_delete: false,
            was_migrated: false,
            prefab: None,
            data: Vec::new(),
        };
        match (prepared, component) {
            (PreparedUpdate::Delete, _) => {
                update.is_delete = true;
                update.was_migrated = self.was_migrated;
            }
            (
                PreparedUpdate::Properties {
                    mut mask,
                    include_prefab,
                },
                Some(component),
            ) => {
                let mut serializer = WriteSerializer::new();
                component
                    .serialize_properties(&mut serializer, &mut mask)
                    .map_err(|source| ReplicationError::PropertySerialize { entity, source })?;
                update.data = serializer.finish().map_err(|err| {
                    ReplicationError::PropertySerialize {
                        entity,
                        source: PropertyError::Serialize(err),
                    }
                })?;
                if include_prefab {
                    let prefab = component.prefab_entity_id();
                    self.prefab = Some(prefab);
                    update.prefab = Some(prefab);
                }
            }
            (PreparedUpdate::Properties { .. }, None) => {
                return Err(ReplicationError::UnexpectedUpdate {
                    entity,
                    reason: "property update without a component",
                });
            }
        }
        Ok(update)
    }

    /// Binds the prepared message to the packet it went out in.
    pub fn finalize_serialization(&mut self, packet_id: PacketId) {
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.finalize_serialization(packet_id);
        }
    }

    pub fn on_packet_acked(&mut self, packet_id: PacketId) {
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.on_packet_acked(packet_id);
        }
    }

    pub fn on_packet_lost(&mut self, packet_id: PacketId) {
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.on_packet_lost(packet_id);
        }
    }

    /// Marks the component's current state as already known to the remote,
    /// so state that just arrived from it is not echoed back.
    pub fn skip_pending_changes(&mut self, component: &dyn NetBindComponent) {
        if let Some(publisher) = self.publisher.as_mut() {
            publisher.skip_changes(component);
        }
    }

    /// The remote lost track of the entity; resend creation state.
    pub fn reset_publisher(&mut self) {
        if let Some(publisher) = self.publisher.as_mut() {
            if !publisher.is_deleting() {
                publisher.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ReplicatedEntity;
    use schema::{ComponentDef, ComponentId, PropertyCodec, PropertyDef, PropertyId};

    fn entity() -> ReplicatedEntity {
        let def = ComponentDef::new(ComponentId::new(1).unwrap()).property(PropertyDef::new(
            PropertyId::new(1).unwrap(),
            PropertyCodec::uint(8),
        ));
        ReplicatedEntity::new(def, PrefabEntityId::new(3, 1), NetEntityRole::Authority)
    }

    fn h() -> NetEntityHandle {
        NetEntityHandle::new(2, 0)
    }

    #[test]
    fn role_matrix() {
        let server_to_sim =
            EntityReplicator::new(h(), NetEntityRole::Authority, NetEntityRole::SimulatedProxy);
        assert!(server_to_sim.publisher().is_some());
        assert!(server_to_sim.subscriber().is_none());
        assert!(server_to_sim.owns_replicator_lifetime());

        let server_to_auto =
            EntityReplicator::new(h(), NetEntityRole::Authority, NetEntityRole::AutonomousProxy);
        assert!(server_to_auto.publisher().is_some());
        assert!(server_to_auto.subscriber().is_some());

        let client_sim =
            EntityReplicator::new(h(), NetEntityRole::SimulatedProxy, NetEntityRole::Authority);
        assert!(client_sim.publisher().is_none());
        assert!(client_sim.subscriber().is_some());
        assert!(!client_sim.owns_replicator_lifetime());

        let client_auto =
            EntityReplicator::new(h(), NetEntityRole::AutonomousProxy, NetEntityRole::Authority);
        let publisher = client_auto.publisher().unwrap();
        assert!(publisher.is_remote_replicator_established());
        assert!(client_auto.subscriber().is_some());
    }

    #[test]
    fn creation_update_carries_prefab_and_remote_role() {
        let mut replicator =
            EntityReplicator::new(h(), NetEntityRole::Authority, NetEntityRole::SimulatedProxy);
        let mut component = entity();
        assert!(replicator.requires_serialization(Some(&mut component)));
        let update = replicator.generate_update(Some(&mut component)).unwrap();
        assert_eq!(update.prefab, Some(PrefabEntityId::new(3, 1)));
        assert_eq!(update.network_role, NetEntityRole::SimulatedProxy);
        assert!(!update.data.is_empty());
        let message = update.message();
        assert_eq!(message.entity_id, h().raw());
        assert!(message.prefab.is_some());
        replicator.finalize_serialization(PacketId::new(1));
        assert!(!replicator.requires_serialization(Some(&mut component)));
    }

    #[test]
    fn missing_component_becomes_delete() {
        let mut replicator =
            EntityReplicator::new(h(), NetEntityRole::Authority, NetEntityRole::SimulatedProxy);
        assert!(replicator.requires_serialization(None));
        assert!(replicator.is_marked_for_removal());
        let update = replicator.generate_update(None).unwrap();
        assert!(update.is_delete);
        assert!(update.message().is_delete);
        replicator.finalize_serialization(PacketId::new(9));
        replicator.on_packet_acked(PacketId::new(9));
        assert!(replicator.publisher().unwrap().is_deletion_acknowledged());
    }

    #[test]
    fn reset_changes_role_and_clears_removal() {
        let mut replicator =
            EntityReplicator::new(h(), NetEntityRole::Authority, NetEntityRole::SimulatedProxy);
        replicator.set_pending_removal(TimeMs::new(10));
        replicator.reset(NetEntityRole::AutonomousProxy);
        assert_eq!(replicator.remote_role(), NetEntityRole::AutonomousProxy);
        assert!(replicator.subscriber().is_some());
        assert_eq!(replicator.pending_removal_deadline(), None);
    }

    #[test]
    fn non_publisher_cannot_generate() {
        let mut replicator =
            EntityReplicator::new(h(), NetEntityRole::SimulatedProxy, NetEntityRole::Authority);
        assert!(!replicator.requires_serialization(None));
        assert!(replicator.generate_update(None).is_err());
    }
}
