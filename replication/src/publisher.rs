//! Outbound property state for one replicated entity.

use wire::PacketId;

use crate::component::{DirtyMask, NetBindComponent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeleteState {
    None,
    Pending,
    Sent(PacketId),
    Acked,
}

#[derive(Debug, Clone, Copy)]
struct SentRecord {
    packet_id: PacketId,
    mask: DirtyMask,
    carried_creation: bool,
}

/// The message a publisher wants sent this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparedUpdate {
    /// Property values for `mask`. `include_prefab` marks a creation update.
    Properties {
        mask: DirtyMask,
        include_prefab: bool,
    },
    /// Tell the remote to delete the entity.
    Delete,
}

/// Tracks what the remote has and has not acknowledged for one entity.
///
/// Every property update carries the pending mask plus the union of all
/// unacknowledged masks, so a newer packet is always a superset of any older
/// one still in flight. A receiver that drops older packets after applying a
/// newer one therefore never loses a property.
#[derive(Debug, Clone)]
pub struct PropertyPublisher {
    remote_established: bool,
    creation_pending: bool,
    pending: DirtyMask,
    in_flight: Vec<SentRecord>,
    prepared: Option<PreparedUpdate>,
    delete: DeleteState,
    seen_sequence: u64,
}

impl PropertyPublisher {
    /// A publisher for an entity the remote does not have yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            remote_established: false,
            creation_pending: true,
            pending: DirtyMask::empty(),
            in_flight: Vec::new(),
            prepared: None,
            delete: DeleteState::None,
            seen_sequence: 0,
        }
    }

    /// A publisher for an entity the remote created itself, such as an
    /// autonomous proxy pushing state back to its authority.
    #[must_use]
    pub const fn established() -> Self {
        Self {
            remote_established: true,
            creation_pending: false,
            pending: DirtyMask::empty(),
            in_flight: Vec::new(),
            prepared: None,
            delete: DeleteState::None,
            seen_sequence: 0,
        }
    }

    #[must_use]
    pub const fn is_remote_replicator_established(&self) -> bool {
        self.remote_established
    }

    /// Pulls properties dirtied since the last collect.
    pub fn collect_dirty(&mut self, component: &dyn NetBindComponent) {
        self.pending = self
            .pending
            .union(component.dirty_since(self.seen_sequence));
        self.seen_sequence = component.change_sequence();
    }

    /// Treats the component's current state as already known to the remote.
    pub fn skip_changes(&mut self, component: &dyn NetBindComponent) {
        self.seen_sequence = component.change_sequence();
    }

    pub fn mark_dirty(&mut self, mask: DirtyMask) {
        self.pending = self.pending.union(mask);
    }

    #[must_use]
    pub fn requires_serialization(&self) -> bool {
        match self.delete {
            DeleteState::Pending => true,
            DeleteState::None => self.creation_pending || !self.pending.is_empty(),
            DeleteState::Sent(_) | DeleteState::Acked => false,
        }
    }

    /// Requests a delete message. Property updates stop.
    pub fn set_deleting(&mut self) {
        if self.delete == DeleteState::None {
            self.delete = DeleteState::Pending;
        }
    }

    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.delete != DeleteState::None
    }

    #[must_use]
    pub fn is_deletion_acknowledged(&self) -> bool {
        self.delete == DeleteState::Acked
    }

    /// Decides what the next message carries. `full_mask` is used until the
    /// remote has acknowledged creation.
    pub fn prepare_update(&mut self, full_mask: DirtyMask) -> PreparedUpdate {
        let update = if self.delete == DeleteState::Pending {
            PreparedUpdate::Delete
        } else if self.remote_established {
            let mask = self
                .in_flight
                .iter()
                .fold(self.pending, |acc, record| acc.union(record.mask));
            PreparedUpdate::Properties {
                mask,
                include_prefab: false,
            }
        } else {
            PreparedUpdate::Properties {
                mask: full_mask,
                include_prefab: true,
            }
        };
        self.prepared = Some(update);
        update
    }

    /// Records that the prepared update went out in `packet_id`.
    pub fn finalize_serialization(&mut self, packet_id: PacketId) {
        match self.prepared.take() {
            Some(PreparedUpdate::Delete) => self.delete = DeleteState::Sent(packet_id),
            Some(PreparedUpdate::Properties {
                mask,
                include_prefab,
            }) => {
                self.in_flight.push(SentRecord {
                    packet_id,
                    mask,
                    carried_creation: include_prefab,
                });
                self.pending = DirtyMask::empty();
                self.creation_pending = false;
            }
            None => log::warn!("finalize_serialization({packet_id}) with nothing prepared"),
        }
    }

    pub fn on_packet_acked(&mut self, packet_id: PacketId) {
        if self.delete == DeleteState::Sent(packet_id) {
            self.delete = DeleteState::Acked;
        }
        let Some(acked) = self.in_flight.iter().find(|r| r.packet_id == packet_id) else {
            return;
        };
        if acked.carried_creation {
            self.remote_established = true;
        }
        // The acked packet covered every older record's mask.
        self.in_flight.retain(|r| r.packet_id > packet_id);
    }

    pub fn on_packet_lost(&mut self, packet_id: PacketId) {
        if self.delete == DeleteState::Sent(packet_id) {
            self.delete = DeleteState::Pending;
        }
        let Some(position) = self.in_flight.iter().position(|r| r.packet_id == packet_id) else {
            return;
        };
        let lost = self.in_flight.remove(position);
        self.pending = self.pending.union(lost.mask);
        if lost.carried_creation && !self.remote_established {
            self.creation_pending = true;
        }
    }

    /// Forgets everything the remote acknowledged; the next update is a
    /// creation update again.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

impl Default for PropertyPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: DirtyMask = DirtyMask::full(4);

    fn id(raw: u32) -> PacketId {
        PacketId::new(raw)
    }

    fn send(publisher: &mut PropertyPublisher, raw: u32) -> PreparedUpdate {
        let update = publisher.prepare_update(FULL);
        publisher.finalize_serialization(id(raw));
        update
    }

    #[test]
    fn creation_until_established() {
        let mut p = PropertyPublisher::new();
        assert!(p.requires_serialization());
        let first = send(&mut p, 1);
        assert_eq!(
            first,
            PreparedUpdate::Properties {
                mask: FULL,
                include_prefab: true
            }
        );
        assert!(!p.requires_serialization());

        p.mark_dirty(DirtyMask::from_raw(1));
        assert_eq!(
            send(&mut p, 2),
            PreparedUpdate::Properties {
                mask: FULL,
                include_prefab: true
            }
        );

        p.on_packet_acked(id(1));
        assert!(p.is_remote_replicator_established());
        p.mark_dirty(DirtyMask::from_raw(0b100));
        let PreparedUpdate::Properties {
            mask,
            include_prefab,
        } = send(&mut p, 3)
        else {
            panic!("expected properties");
        };
        assert!(!include_prefab);
        // Packet 2 is still in flight, so its mask rides along.
        assert_eq!(mask, FULL);
    }

    #[test]
    fn newer_update_is_superset_of_in_flight() {
        let mut p = PropertyPublisher::established();
        p.mark_dirty(DirtyMask::from_raw(0b01));
        send(&mut p, 1);
        p.mark_dirty(DirtyMask::from_raw(0b10));
        assert_eq!(
            p.prepare_update(FULL),
            PreparedUpdate::Properties {
                mask: DirtyMask::from_raw(0b11),
                include_prefab: false
            }
        );
    }

    #[test]
    fn ack_retires_older_records() {
        let mut p = PropertyPublisher::established();
        p.mark_dirty(DirtyMask::from_raw(1));
        send(&mut p, 1);
        p.mark_dirty(DirtyMask::from_raw(2));
        send(&mut p, 2);
        assert_eq!(p.in_flight_count(), 2);
        p.on_packet_acked(id(2));
        assert_eq!(p.in_flight_count(), 0);
        p.on_packet_lost(id(1));
        assert!(!p.requires_serialization());
    }

    #[test]
    fn loss_requeues_mask() {
        let mut p = PropertyPublisher::established();
        p.mark_dirty(DirtyMask::from_raw(0b100));
        send(&mut p, 7);
        assert!(!p.requires_serialization());
        p.on_packet_lost(id(7));
        assert!(p.requires_serialization());
        assert_eq!(
            p.prepare_update(FULL),
            PreparedUpdate::Properties {
                mask: DirtyMask::from_raw(0b100),
                include_prefab: false
            }
        );
    }

    #[test]
    fn lost_creation_is_resent() {
        let mut p = PropertyPublisher::new();
        send(&mut p, 1);
        p.on_packet_lost(id(1));
        assert!(p.requires_serialization());
        assert!(matches!(
            p.prepare_update(FULL),
            PreparedUpdate::Properties {
                include_prefab: true,
                ..
            }
        ));
    }

    #[test]
    fn delete_state_machine() {
        let mut p = PropertyPublisher::established();
        p.set_deleting();
        assert!(p.is_deleting());
        assert!(p.requires_serialization());
        assert_eq!(send(&mut p, 4), PreparedUpdate::Delete);
        assert!(!p.requires_serialization());

        p.on_packet_lost(id(4));
        assert!(p.requires_serialization());
        assert_eq!(send(&mut p, 5), PreparedUpdate::Delete);
        p.on_packet_acked(id(4));
        assert!(!p.is_deletion_acknowledged());
        p.on_packet_acked(id(5));
        assert!(p.is_deletion_acknowledged());
    }

    #[test]
    fn publishers_observe_independently() {
        use crate::component::ReplicatedEntity;
        use crate::role::NetEntityRole;
        use crate::value::PropertyValue;
        use schema::{ComponentDef, ComponentId, PropertyCodec, PropertyDef, PropertyId};
        use wire::PrefabEntityId;

        let pid = PropertyId::new(2).unwrap();
        let def = ComponentDef::new(ComponentId::new(1).unwrap())
            .property(PropertyDef::new(PropertyId::new(1).unwrap(), PropertyCodec::bool()))
            .property(PropertyDef::new(pid, PropertyCodec::uint(8)));
        let mut entity = ReplicatedEntity::new(def, PrefabEntityId::new(1, 0), NetEntityRole::Authority);
        let mut a = PropertyPublisher::established();
        let mut b = PropertyPublisher::established();
        a.skip_changes(&entity);
        b.skip_changes(&entity);

        entity.set_property(pid, PropertyValue::UInt(9)).unwrap();
        a.collect_dirty(&entity);
        b.collect_dirty(&entity);
        let expected = PreparedUpdate::Properties {
            mask: DirtyMask::from_raw(0b10),
            include_prefab: false,
        };
        assert_eq!(a.prepare_update(FULL), expected);
        assert_eq!(b.prepare_update(FULL), expected);

        a.finalize_serialization(id(1));
        a.on_packet_acked(id(1));
        a.collect_dirty(&entity);
        assert!(!a.requires_serialization());
    }

    #[test]
    fn reset_requires_creation() {
        let mut p = PropertyPublisher::established();
        p.reset();
        assert!(!p.is_remote_replicator_established());
        assert!(p.requires_serialization());
    }
}
