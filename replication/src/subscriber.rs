//! Inbound property state for one replicated entity.

use bitstream::NetSerializer;
use wire::PacketId;

use crate::component::{DirtyMask, NetBindComponent};
use crate::error::{ReplicationError, ReplicationResult};
use crate::types::{NetEntityHandle, TimeMs};

/// What happened to an inbound property change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The values were applied to the component.
    Applied,
    /// The packet was not newer than the last one applied; nothing changed.
    Stale,
    /// The subscriber is deleted and ignores all traffic.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Active,
    Deleting { since: TimeMs },
    Deleted,
}

/// Applies remote property updates for one entity in packet order.
///
/// The subscriber keeps the id of the newest packet applied. Anything at or
/// below that watermark is rejected, which makes application idempotent
/// under duplication and monotone under reordering.
#[derive(Debug, Clone)]
pub struct PropertySubscriber {
    handle: NetEntityHandle,
    last_received_packet_id: PacketId,
    lifecycle: Lifecycle,
}

impl PropertySubscriber {
    #[must_use]
    pub const fn new(handle: NetEntityHandle) -> Self {
        Self {
            handle,
            last_received_packet_id: PacketId::INVALID,
            lifecycle: Lifecycle::Active,
        }
    }

    #[must_use]
    pub const fn handle(&self) -> NetEntityHandle {
        self.handle
    }

    #[must_use]
    pub const fn last_received_packet_id(&self) -> PacketId {
        self.last_received_packet_id
    }

    /// A packet is valid if it is strictly newer than the last one applied.
    #[must_use]
    pub fn is_packet_id_valid(&self, packet_id: PacketId) -> bool {
        packet_id > self.last_received_packet_id
    }

    /// Advances the watermark for a message that carries no properties,
    /// such as a delete. Returns `false` if the packet is stale.
    pub fn accept_packet_id(&mut self, packet_id: PacketId) -> bool {
        if self.is_deleted() || !self.is_packet_id_valid(packet_id) {
            return false;
        }
        self.last_received_packet_id = packet_id;
        true
    }

    /// Applies one property change message.
    ///
    /// The watermark advances before the component reads, so a payload that
    /// fails to deserialize still consumes its packet id. That failure is
    /// returned as [`ReplicationError::PropertyDeserialize`] and is fatal
    /// for the connection.
    pub fn handle_property_change_message(
        &mut self,
        packet_id: PacketId,
        component: &mut dyn NetBindComponent,
        serializer: &mut dyn NetSerializer,
        notify_changes: bool,
    ) -> ReplicationResult<ChangeOutcome> {
        if self.is_deleted() {
            return Ok(ChangeOutcome::Discarded);
        }
        if !self.is_packet_id_valid(packet_id) {
            log::trace!(
                "entity {}: dropping stale packet {packet_id} (last {})",
                self.handle,
                self.last_received_packet_id
            );
            return Ok(ChangeOutcome::Stale);
        }

        self.last_received_packet_id = packet_id;
        let mut mask = DirtyMask::empty();
        component
            .serialize_properties(serializer, &mut mask)
            .map_err(|source| ReplicationError::PropertyDeserialize {
                entity: self.handle,
                packet_id,
                source,
            })?;
        if notify_changes {
            component.notify_property_changes(mask);
        }
        Ok(ChangeOutcome::Applied)
    }

    /// Starts the removal grace period. Stale packets are still rejected.
    pub fn set_deleting(&mut self, now: TimeMs) {
        if self.lifecycle == Lifecycle::Active {
            self.lifecycle = Lifecycle::Deleting { since: now };
        }
    }

    /// Cancels a pending removal; the entity is back in play.
    pub fn clear_deleting(&mut self) {
        if matches!(self.lifecycle, Lifecycle::Deleting { .. }) {
            self.lifecycle = Lifecycle::Active;
        }
    }

    /// Final state. A deleted subscriber discards everything.
    pub fn set_deleted(&mut self) {
        self.lifecycle = Lifecycle::Deleted;
    }

    #[must_use]
    pub const fn is_deleting(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Deleting { .. })
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Deleted)
    }

    /// When the grace period started, if one is running.
    #[must_use]
    pub const fn mark_for_removal_time(&self) -> Option<TimeMs> {
        match self.lifecycle {
            Lifecycle::Deleting { since } => Some(since),
            _ => None,
        }
    }
}
