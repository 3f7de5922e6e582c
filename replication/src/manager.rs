//! Per-connection entity replication manager.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use bitstream::ReadSerializer;
use wire::{
    decode_packet, encode_reset_packet, encode_update_packet, update_packet_size,
    EntityUpdateMessage, Limits, PacketBody, PacketId, PrefabEntityId, HEADER_SIZE,
};

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::publisher::PropertyPublisher;
use crate::replicator::{EntityReplicator, OutboundUpdate};
use crate::role::NetEntityRole;
use crate::subscriber::{ChangeOutcome, PropertySubscriber};
use crate::types::{NetEntityHandle, TimeMs};
use crate::window::ReplicationWindow;
use crate::world::EntityWorld;

/// Which side of which kind of connection this manager serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UpdateMode {
    LocalServerToRemoteClient,
    LocalClientToRemoteServer,
    LocalServerToRemoteServer,
}

/// Verdict on an inbound entity message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateValidation {
    HandleMessage,
    DropMessage,
    DropMessageAndDisconnect,
}

/// Packets this many ids behind an acknowledged one count as lost.
pub const UNREPORTED_PACKET_WINDOW: u32 = 1024;

/// Outbound transport for one connection.
pub trait PacketSender {
    /// Sends one packet and returns the id the transport assigned to it.
    ///
    /// The transport must later report every id through
    /// [`EntityReplicationManager::on_packet_acked`] or
    /// [`EntityReplicationManager::on_packet_lost`]. Ids it never reports
    /// are treated as lost once an id [`UNREPORTED_PACKET_WINDOW`] newer is
    /// acknowledged.
    fn send_packet(&mut self, bytes: &[u8]) -> PacketId;
}

/// Counters from one [`EntityReplicationManager::send_updates`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub packets: usize,
    pub bytes: usize,
    pub updates: usize,
    pub deletes: usize,
    pub resets: usize,
}

/// Replicates entities over one connection.
///
/// Outbound, the manager turns the replication window's set into
/// replicators, serializes what changed, and packs messages into packets no
/// larger than the connection allows. Inbound, it validates every message
/// against the connection's trust rules before it reaches a subscriber.
///
/// Every `Err` returned from [`handle_packet`](Self::handle_packet) is fatal
/// for the connection.
pub struct EntityReplicationManager {
    mode: UpdateMode,
    remote_host: String,
    schema_hash: u64,
    config: ReplicationConfig,
    limits: Limits,
    window: Option<Box<dyn ReplicationWindow>>,
    replicators: BTreeMap<NetEntityHandle, EntityReplicator>,
    remote_entities_pending_creation: BTreeSet<NetEntityHandle>,
    entities_pending_activation: VecDeque<NetEntityHandle>,
    replicators_pending_reset: BTreeSet<NetEntityHandle>,
    sent_packets: HashMap<PacketId, Vec<NetEntityHandle>>,
    frame_time: TimeMs,
    packet_buf: Vec<u8>,
}

impl EntityReplicationManager {
    #[must_use]
    pub fn new(
        mode: UpdateMode,
        remote_host: impl Into<String>,
        schema_hash: u64,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            mode,
            remote_host: remote_host.into(),
            schema_hash,
            config,
            limits: Limits::default(),
            window: None,
            replicators: BTreeMap::new(),
            remote_entities_pending_creation: BTreeSet::new(),
            entities_pending_activation: VecDeque::new(),
            replicators_pending_reset: BTreeSet::new(),
            sent_packets: HashMap::new(),
            frame_time: TimeMs::ZERO,
            packet_buf: Vec::new(),
        }
    }

    /// Overrides the decode limits applied to inbound packets.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub const fn mode(&self) -> UpdateMode {
        self.mode
    }

    #[must_use]
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    #[must_use]
    pub const fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Time passed to the most recent send or receive.
    #[must_use]
    pub const fn frame_time(&self) -> TimeMs {
        self.frame_time
    }

    /// Installs the connection's window and applies its set immediately.
    pub fn set_replication_window(
        &mut self,
        mut window: Box<dyn ReplicationWindow>,
        world: &dyn EntityWorld,
        now: TimeMs,
    ) {
        window.update_window();
        self.window = Some(window);
        self.update_window(world, now);
    }

    #[must_use]
    pub fn replication_window(&self) -> Option<&dyn ReplicationWindow> {
        self.window.as_deref()
    }

    pub fn replication_window_mut(&mut self) -> Option<&mut (dyn ReplicationWindow + 'static)> {
        self.window.as_deref_mut()
    }

    /// Reconciles replicators with a freshly computed replication set.
    ///
    /// Entities new to the set get a replicator, entities whose role changed
    /// are reset, and entities that left the set get a removal deadline if
    /// this host owns their lifetime.
    pub fn update_window(&mut self, world: &dyn EntityWorld, now: TimeMs) {
        let Some(window) = self.window.as_mut() else {
            return;
        };
        if !window.replication_set_update_ready() {
            return;
        }
        let wanted: Vec<_> = window
            .replication_set()
            .iter()
            .map(|(handle, data)| (*handle, *data))
            .collect();
        let current: Vec<NetEntityHandle> = self.replicators.keys().copied().collect();
        let deadline = now.saturating_add(self.config.entity_pending_removal_ms);

        let mut wanted_iter = wanted.into_iter().peekable();
        let mut current_iter = current.into_iter().peekable();
        loop {
            match (wanted_iter.peek().copied(), current_iter.peek().copied()) {
                (Some((handle, data)), Some(existing)) if handle < existing => {
                    self.add_with_priority(handle, data.role, data.priority, world);
                    wanted_iter.next();
                }
                (Some((handle, _)), Some(existing)) if handle > existing => {
                    self.schedule_removal(existing, deadline);
                    current_iter.next();
                }
                (Some((handle, data)), Some(_)) => {
                    let role_changed = self
                        .replicators
                        .get(&handle)
                        .is_some_and(|r| r.remote_role() != data.role);
                    if role_changed {
                        self.add_entity_replicator(handle, data.role, world);
                    }
                    if let Some(replicator) = self.replicators.get_mut(&handle) {
                        replicator.clear_pending_removal();
                        replicator.set_priority(data.priority);
                        if replicator.is_marked_for_removal() && replicator.owns_replicator_lifetime()
                        {
                            // Back in view after the delete went out.
                            replicator.reset(data.role);
                        }
                    }
                    wanted_iter.next();
                    current_iter.next();
                }
                (Some((handle, data)), None) => {
                    self.add_with_priority(handle, data.role, data.priority, world);
                    wanted_iter.next();
                }
                (None, Some(existing)) => {
                    self.schedule_removal(existing, deadline);
                    current_iter.next();
                }
                (None, None) => break,
            }
        }
    }

    fn add_with_priority(
        &mut self,
        handle: NetEntityHandle,
        role: NetEntityRole,
        priority: f32,
        world: &dyn EntityWorld,
    ) {
        if let Some(replicator) = self.add_entity_replicator(handle, role, world) {
            replicator.set_priority(priority);
        }
    }

    fn schedule_removal(&mut self, handle: NetEntityHandle, deadline: TimeMs) {
        if let Some(replicator) = self.replicators.get_mut(&handle) {
            if replicator.owns_replicator_lifetime() && !replicator.is_marked_for_removal() {
                replicator.set_pending_removal(deadline);
            }
        }
    }

    /// Creates or refreshes the replicator for a local entity.
    ///
    /// The bound local role is read from the entity. A change of either role
    /// rebuilds the replicator's publisher and subscriber.
    pub fn add_entity_replicator(
        &mut self,
        handle: NetEntityHandle,
        remote_role: NetEntityRole,
        world: &dyn EntityWorld,
    ) -> Option<&mut EntityReplicator> {
        let Some(component) = world.component(handle) else {
            log::error!(
                "cannot add replicator for {handle} to {}: entity does not exist",
                self.remote_host
            );
            return None;
        };
        let local_role = component.net_entity_role();

        if let Some(existing) = self.replicators.get_mut(&handle) {
            let changed_local = existing.bound_local_role() != local_role;
            let changed_remote = existing.remote_role() != remote_role;
            if changed_local {
                log::debug!(
                    "entity {handle}: local role changed {} -> {local_role}",
                    existing.bound_local_role()
                );
                *existing = EntityReplicator::new(handle, local_role, remote_role);
            } else if changed_remote {
                existing.reset(remote_role);
            }
            existing.clear_pending_removal();
            log::debug!(
                "reinitialized replicator for {handle} to {} role {remote_role}",
                self.remote_host
            );
        } else {
            log::debug!(
                "added replicator for {handle} to {} role {remote_role}",
                self.remote_host
            );
            self.replicators
                .insert(handle, EntityReplicator::new(handle, local_role, remote_role));
        }
        self.replicators.get_mut(&handle)
    }

    /// Adjusts this connection after authority over `handle` moved to the
    /// host `new_owner`.
    ///
    /// The connection to the new owner is left alone. Elsewhere the entity
    /// is re-bound with its window role if the window still wants it, and
    /// otherwise deleted with the migrated flag so the remote keeps its copy
    /// for the new owner to take over.
    pub fn on_entity_migrated(
        &mut self,
        handle: NetEntityHandle,
        new_owner: &str,
        world: &dyn EntityWorld,
    ) {
        if new_owner == self.remote_host {
            return;
        }
        let in_window = self
            .window
            .as_ref()
            .and_then(|window| window.is_in_window(handle));
        match in_window {
            Some(role) => {
                self.add_entity_replicator(handle, role, world);
            }
            None => {
                if let Some(replicator) = self.replicators.get_mut(&handle) {
                    log::debug!(
                        "entity {handle}: migrated to {new_owner}, removing from {}",
                        self.remote_host
                    );
                    replicator.set_was_migrated(true);
                    replicator.mark_for_removal();
                }
            }
        }
    }

    /// Picks the replicators to serialize this tick.
    ///
    /// Autonomous replicators are always included. Other replicators are
    /// taken in descending priority up to the window's send cap, with
    /// deletes sharing the same budget. Replicators whose creation is not
    /// yet acknowledged are held back once
    /// `max_remote_entities_pending_creation` are outstanding.
    pub fn generate_entity_update_list(
        &mut self,
        world: &mut dyn EntityWorld,
    ) -> Vec<NetEntityHandle> {
        let cap = self
            .window
            .as_ref()
            .map_or(0, |window| window.max_entity_replicator_send_count() as usize);
        let max_pending_creation = self.config.max_remote_entities_pending_creation;

        let mut autonomous = Vec::new();
        let mut proxies = Vec::new();
        for (handle, replicator) in &mut self.replicators {
            let Some(publisher) = replicator.publisher() else {
                continue;
            };
            let established = publisher.is_remote_replicator_established();
            if established {
                self.remote_entities_pending_creation.remove(handle);
            } else if !publisher.is_deleting()
                && self.remote_entities_pending_creation.len() >= max_pending_creation
                && !self.remote_entities_pending_creation.contains(handle)
            {
                continue;
            }

            if !replicator.requires_serialization(world.component_mut(*handle)) {
                continue;
            }
            if replicator
                .publisher()
                .is_some_and(|p| !p.is_remote_replicator_established() && !p.is_deleting())
            {
                self.remote_entities_pending_creation.insert(*handle);
            }

            if replicator.remote_role() == NetEntityRole::AutonomousProxy
                || replicator.bound_local_role() == NetEntityRole::AutonomousProxy
            {
                autonomous.push(*handle);
            } else {
                proxies.push((*handle, replicator.priority()));
            }
        }

        proxies.sort_by(|(ha, a), (hb, b)| b.total_cmp(a).then(ha.cmp(hb)));
        if proxies.len() > cap {
            log::trace!(
                "send cap {cap} reached for {}, deferring {} entities",
                self.remote_host,
                proxies.len() - cap
            );
            proxies.truncate(cap);
        }
        autonomous.extend(proxies.into_iter().map(|(handle, _)| handle));
        autonomous
    }

    /// Serializes and sends everything due this tick, then any pending
    /// reset requests.
    pub fn send_updates(
        &mut self,
        world: &mut dyn EntityWorld,
        sender: &mut dyn PacketSender,
        now: TimeMs,
    ) -> ReplicationResult<SendStats> {
        self.frame_time = now;
        self.expire_pending_removals(now);

        let to_send = self.generate_entity_update_list(world);
        let mut updates = Vec::with_capacity(to_send.len());
        for handle in to_send {
            if let Some(replicator) = self.replicators.get_mut(&handle) {
                updates.push(replicator.generate_update(world.component_mut(handle))?);
            }
        }

        let mut stats = SendStats::default();
        let max_payload = self.config.max_payload_bytes().saturating_sub(HEADER_SIZE);
        let max_messages = self.config.max_messages_per_packet.clamp(1, usize::from(u16::MAX));
        let mut start = 0;
        while start < updates.len() {
            let end = self.next_batch_end(&updates, start, max_payload, max_messages);
            let batch = &updates[start..end];
            let packet_id = self.send_update_packet(batch, sender, &mut stats)?;
            for update in batch {
                if let Some(replicator) = self.replicators.get_mut(&update.handle) {
                    replicator.finalize_serialization(packet_id);
                }
            }
            self.sent_packets
                .insert(packet_id, batch.iter().map(|u| u.handle).collect());
            start = end;
        }

        self.send_entity_resets(sender, &mut stats)?;
        log::debug!(
            "sent {} updates, {} deletes in {} packets to {} ({} replicators)",
            stats.updates,
            stats.deletes,
            stats.packets,
            self.remote_host,
            self.replicators.len()
        );
        Ok(stats)
    }

    fn next_batch_end(
        &self,
        updates: &[OutboundUpdate],
        start: usize,
        max_payload: usize,
        max_messages: usize,
    ) -> usize {
        let mut size = 0;
        let mut end = start;
        while end < updates.len() && end - start < max_messages {
            let next = updates[end].message().estimated_size();
            if size + next > max_payload {
                if end == start {
                    log::warn!(
                        "serializing oversized entity {} for {}: {next} bytes, max payload {max_payload}",
                        updates[end].handle,
                        self.remote_host
                    );
                    end += 1;
                }
                break;
            }
            size += next;
            end += 1;
        }
        end
    }

    fn send_update_packet(
        &mut self,
        batch: &[OutboundUpdate],
        sender: &mut dyn PacketSender,
        stats: &mut SendStats,
    ) -> ReplicationResult<PacketId> {
        let messages: Vec<EntityUpdateMessage<'_>> =
            batch.iter().map(OutboundUpdate::message).collect();
        self.packet_buf.clear();
        self.packet_buf.resize(update_packet_size(&messages), 0);
        let written = encode_update_packet(self.schema_hash, &messages, &mut self.packet_buf)?;
        let packet_id = sender.send_packet(&self.packet_buf[..written]);
        stats.packets += 1;
        stats.bytes += written;
        for update in batch {
            if update.is_delete {
                stats.deletes += 1;
            } else {
                stats.updates += 1;
            }
        }
        Ok(packet_id)
    }

    fn send_entity_resets(
        &mut self,
        sender: &mut dyn PacketSender,
        stats: &mut SendStats,
    ) -> ReplicationResult<()> {
        if self.replicators_pending_reset.is_empty() {
            return Ok(());
        }
        let ids: Vec<u64> = std::mem::take(&mut self.replicators_pending_reset)
            .into_iter()
            .map(NetEntityHandle::raw)
            .collect();
        let per_packet = self.config.max_messages_per_packet.clamp(1, usize::from(u16::MAX));
        for chunk in ids.chunks(per_packet) {
            let needed = HEADER_SIZE + chunk.len() * 10;
            self.packet_buf.clear();
            self.packet_buf.resize(needed, 0);
            let written = encode_reset_packet(self.schema_hash, chunk, &mut self.packet_buf)?;
            sender.send_packet(&self.packet_buf[..written]);
            stats.packets += 1;
            stats.bytes += written;
            stats.resets += chunk.len();
        }
        log::debug!("requested reset of {} entities from {}", ids.len(), self.remote_host);
        Ok(())
    }

    fn expire_pending_removals(&mut self, now: TimeMs) {
        for (handle, replicator) in &mut self.replicators {
            if replicator
                .pending_removal_deadline()
                .is_some_and(|deadline| deadline <= now)
            {
                log::debug!("entity {handle}: removal deadline passed, deleting on {}", self.remote_host);
                replicator.mark_for_removal();
            }
        }
    }

    /// Processes one inbound packet.
    ///
    /// `packet_id` is the transport's id for these bytes. Any error is
    /// fatal for the connection; the caller should log it and disconnect.
    pub fn handle_packet(
        &mut self,
        packet_id: PacketId,
        bytes: &[u8],
        world: &mut dyn EntityWorld,
        now: TimeMs,
    ) -> ReplicationResult<()> {
        self.frame_time = now;
        let packet = decode_packet(bytes, &self.limits).map_err(|err| {
            log::error!("malformed packet {packet_id} from {}: {err}", self.remote_host);
            ReplicationError::from(err)
        })?;
        if packet.header.schema_hash != self.schema_hash {
            return Err(ReplicationError::SchemaMismatch {
                expected: self.schema_hash,
                found: packet.header.schema_hash,
            });
        }
        match packet.body {
            PacketBody::EntityUpdates(messages) => {
                for message in &messages {
                    self.handle_entity_update_message(packet_id, message, world, now)?;
                }
            }
            PacketBody::EntityResets(ids) => self.handle_entity_reset_messages(&ids),
        }
        Ok(())
    }

    fn handle_entity_update_message(
        &mut self,
        packet_id: PacketId,
        message: &EntityUpdateMessage<'_>,
        world: &mut dyn EntityWorld,
        now: TimeMs,
    ) -> ReplicationResult<()> {
        let handle = NetEntityHandle::from_raw(message.entity_id);
        let role = NetEntityRole::from_raw(message.network_role)
            .filter(|role| role.is_valid())
            .ok_or(ReplicationError::InvalidRole {
                entity: handle,
                raw: message.network_role,
            })?;

        match self.validate_update(message, role, packet_id, handle) {
            UpdateValidation::HandleMessage => {}
            UpdateValidation::DropMessage => return Ok(()),
            UpdateValidation::DropMessageAndDisconnect => {
                return Err(ReplicationError::UnexpectedUpdate {
                    entity: handle,
                    reason: "update not permitted on this connection",
                });
            }
        }

        if message.is_delete {
            self.handle_entity_delete_message(handle, role, packet_id, message.was_migrated, world, now);
            return Ok(());
        }

        let known_prefab = self
            .replicators
            .get(&handle)
            .and_then(EntityReplicator::prefab_entity_id);
        let Some(prefab) = message.prefab.or(known_prefab) else {
            log::warn!(
                "entity {handle}: update without prefab from {} for an unknown entity, requesting reset",
                self.remote_host
            );
            self.replicators_pending_reset.insert(handle);
            return Ok(());
        };

        self.handle_property_change_message(packet_id, handle, role, prefab, message.data, world)
    }

    /// Applies the connection's trust rules to an inbound message.
    pub fn validate_update(
        &self,
        message: &EntityUpdateMessage<'_>,
        role: NetEntityRole,
        packet_id: PacketId,
        handle: NetEntityHandle,
    ) -> UpdateValidation {
        let replicator = self.replicators.get(&handle);
        let mut result = match self.mode {
            UpdateMode::LocalServerToRemoteClient => {
                // Clients may only push state for entities they control and
                // may never delete.
                let result = match replicator {
                    Some(r)
                        if role == NetEntityRole::Authority
                            && !message.is_delete
                            && r.remote_role() == NetEntityRole::AutonomousProxy
                            && r.bound_local_role() == NetEntityRole::Authority =>
                    {
                        if r.is_marked_for_removal() {
                            UpdateValidation::DropMessage
                        } else {
                            UpdateValidation::HandleMessage
                        }
                    }
                    _ => UpdateValidation::DropMessageAndDisconnect,
                };
                if result == UpdateValidation::DropMessageAndDisconnect {
                    log::warn!(
                        "unexpected update from client {} for {handle}: role {role}, delete {}, replicator {:?}",
                        self.remote_host,
                        message.is_delete,
                        replicator.map(|r| (r.remote_role(), r.bound_local_role()))
                    );
                }
                result
            }
            UpdateMode::LocalServerToRemoteServer => match replicator {
                // A previous owner's late message after we took ownership.
                Some(r)
                    if !r.is_marked_for_removal()
                        && r.bound_local_role() == NetEntityRole::Authority =>
                {
                    UpdateValidation::DropMessage
                }
                _ => UpdateValidation::HandleMessage,
            },
            UpdateMode::LocalClientToRemoteServer => UpdateValidation::HandleMessage,
        };

        if result == UpdateValidation::HandleMessage {
            let subscriber = replicator.and_then(EntityReplicator::subscriber);
            if let Some(subscriber) = subscriber.filter(|s| !s.is_deleted()) {
                if !subscriber.is_packet_id_valid(packet_id) {
                    log::trace!(
                        "entity {handle}: old {} packet {packet_id} from {}, latest {}",
                        if message.is_delete { "delete" } else { "update" },
                        self.remote_host,
                        subscriber.last_received_packet_id()
                    );
                    result = UpdateValidation::DropMessage;
                }
            }
        }
        result
    }

    fn handle_entity_delete_message(
        &mut self,
        handle: NetEntityHandle,
        role: NetEntityRole,
        packet_id: PacketId,
        was_migrated: bool,
        world: &mut dyn EntityWorld,
        now: TimeMs,
    ) {
        if !self.replicators.contains_key(&handle) {
            if role == NetEntityRole::Authority {
                log::debug!("entity {handle}: delete from {} for a replicator already gone", self.remote_host);
                return;
            }
            // Tombstone so a delayed creation cannot revive the entity.
            log::debug!("entity {handle}: delete from {} before creation arrived", self.remote_host);
            self.replicators
                .insert(handle, EntityReplicator::new(handle, role, NetEntityRole::Authority));
        }
        let Some(replicator) = self.replicators.get_mut(&handle) else {
            return;
        };
        if replicator.owns_replicator_lifetime() {
            log::debug!("entity {handle}: ignoring delete from {} for a replicator we own", self.remote_host);
            return;
        }
        let Some(subscriber) = replicator.subscriber_mut() else {
            return;
        };
        if subscriber.is_deleting() {
            log::warn!("entity {handle}: already marked for deletion on {}", self.remote_host);
            return;
        }
        subscriber.accept_packet_id(packet_id);
        subscriber.set_deleting(now);
        self.entities_pending_activation.retain(|pending| *pending != handle);

        if was_migrated {
            log::debug!("entity {handle}: left {} by migration, keeping local copy", self.remote_host);
            replicator.set_was_migrated(true);
        } else {
            log::debug!("entity {handle}: deleted by {}", self.remote_host);
            world.remove_entity(handle);
        }
    }

    fn handle_property_change_message(
        &mut self,
        packet_id: PacketId,
        handle: NetEntityHandle,
        role: NetEntityRole,
        prefab: PrefabEntityId,
        data: &[u8],
        world: &mut dyn EntityWorld,
    ) -> ReplicationResult<()> {
        let create_entity = !world.contains(handle);
        let notify = !create_entity && world.is_active(handle);
        if create_entity {
            world.create_entity(handle, prefab, role)?;
        }
        let Some(component) = world.component_mut(handle) else {
            return Err(ReplicationError::EntityCreateFailed {
                entity: handle,
                prefab,
            });
        };
        if component.net_entity_role() != role {
            log::info!(
                "entity {handle}: network role {} -> {role}",
                component.net_entity_role()
            );
            component.set_net_entity_role(role);
        }

        let create_replicator = self
            .replicators
            .get(&handle)
            .map_or(true, |r| r.bound_local_role() != role);
        if create_replicator {
            log::debug!("added replicator for {handle} from {} role {role}", self.remote_host);
            self.replicators.insert(
                handle,
                EntityReplicator::new(handle, role, NetEntityRole::Authority),
            );
        }
        let Some(replicator) = self.replicators.get_mut(&handle) else {
            return Ok(());
        };
        if create_entity || create_replicator {
            // State that came from the remote is not echoed back.
            replicator.skip_pending_changes(&*component);
        }
        replicator.set_prefab_entity_id(prefab);
        let Some(subscriber) = replicator.subscriber_mut() else {
            return Err(ReplicationError::UnexpectedUpdate {
                entity: handle,
                reason: "replicator does not subscribe",
            });
        };
        subscriber.clear_deleting();

        let mut serializer = ReadSerializer::new(data);
        let outcome = match subscriber.handle_property_change_message(
            packet_id,
            component,
            &mut serializer,
            notify,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                if create_entity {
                    log::error!(
                        "entity {handle}: creation from {} failed to decode, removing it",
                        self.remote_host
                    );
                    self.replicators.remove(&handle);
                    world.remove_entity(handle);
                }
                return Err(err);
            }
        };
        if create_entity {
            self.entities_pending_activation.push_back(handle);
        }
        if outcome == ChangeOutcome::Discarded {
            log::trace!("entity {handle}: update discarded by deleted subscriber");
        }
        Ok(())
    }

    fn handle_entity_reset_messages(&mut self, ids: &[u64]) {
        for raw in ids {
            let handle = NetEntityHandle::from_raw(*raw);
            if let Some(replicator) = self.replicators.get_mut(&handle) {
                log::debug!("entity {handle}: reset requested by {}", self.remote_host);
                replicator.reset_publisher();
            }
        }
    }

    /// Forwards a delivery acknowledgement to the replicators in the packet.
    pub fn on_packet_acked(&mut self, packet_id: PacketId) {
        let Some(handles) = self.sent_packets.remove(&packet_id) else {
            return;
        };
        for handle in handles {
            if let Some(replicator) = self.replicators.get_mut(&handle) {
                replicator.on_packet_acked(packet_id);
            }
        }
        self.expire_unreported(packet_id);
    }

    fn expire_unreported(&mut self, acked: PacketId) {
        let Some(horizon) = acked.raw().checked_sub(UNREPORTED_PACKET_WINDOW) else {
            return;
        };
        let expired: Vec<PacketId> = self
            .sent_packets
            .keys()
            .filter(|id| id.raw() < horizon)
            .copied()
            .collect();
        for id in expired {
            log::warn!("packet {id} to {} was never reported, treating it as lost", self.remote_host);
            self.on_packet_lost(id);
        }
    }

    /// Sent packets still waiting for an ack or loss report.
    #[must_use]
    pub fn packets_in_flight(&self) -> usize {
        self.sent_packets.len()
    }

    /// Forwards a loss notification; the replicators resend what it carried.
    pub fn on_packet_lost(&mut self, packet_id: PacketId) {
        let Some(handles) = self.sent_packets.remove(&packet_id) else {
            return;
        };
        for handle in handles {
            if let Some(replicator) = self.replicators.get_mut(&handle) {
                replicator.on_packet_lost(packet_id);
            }
        }
    }

    /// Drops replicators whose delete the remote acknowledged and
    /// subscribers whose removal grace period has elapsed.
    pub fn clear_removed_replicators(&mut self, world: &mut dyn EntityWorld, now: TimeMs) {
        let grace = self.config.subscriber_removal_grace_ms;
        let mut removed = Vec::new();
        for (handle, replicator) in &mut self.replicators {
            if replicator
                .publisher()
                .is_some_and(PropertyPublisher::is_deletion_acknowledged)
            {
                removed.push((*handle, false));
                continue;
            }
            let migrated = replicator.was_migrated();
            if let Some(subscriber) = replicator.subscriber_mut() {
                let expired = subscriber
                    .mark_for_removal_time()
                    .is_some_and(|since| now >= since.saturating_add(grace));
                if expired {
                    subscriber.set_deleted();
                    removed.push((*handle, !migrated));
                }
            }
        }
        for (handle, remote_deleted) in removed {
            log::debug!("entity {handle}: removed replicator for {}", self.remote_host);
            self.replicators.remove(&handle);
            self.remote_entities_pending_creation.remove(&handle);
            if remote_deleted && world.contains(handle) {
                world.remove_entity(handle);
            }
        }
    }

    /// Activates newly created entities in arrival order.
    ///
    /// With a non-zero `entity_activation_time_slice_ms` the loop stops once
    /// the slice is used up; the rest wait for the next call. Entities that
    /// are not ready are retried next call. Returns the number activated.
    pub fn activate_pending_entities(&mut self, world: &mut dyn EntityWorld) -> usize {
        let started = Instant::now();
        let slice = Duration::from_millis(self.config.entity_activation_time_slice_ms);
        let mut not_ready = Vec::new();
        let mut activated = 0;
        while let Some(handle) = self.entities_pending_activation.pop_front() {
            let live = self.replicators.get(&handle).is_some_and(|r| {
                !r.subscriber().is_some_and(PropertySubscriber::is_deleting)
            });
            if live && world.contains(handle) {
                if world.activate_entity(handle) {
                    activated += 1;
                } else {
                    not_ready.push(handle);
                }
            }
            if !slice.is_zero() && started.elapsed() > slice {
                break;
            }
        }
        self.entities_pending_activation.extend(not_ready);
        activated
    }

    #[must_use]
    pub fn entity_replicator(&self, handle: NetEntityHandle) -> Option<&EntityReplicator> {
        self.replicators.get(&handle)
    }

    /// Number of replicators bound to `local_role`.
    #[must_use]
    pub fn entity_replicator_count(&self, local_role: NetEntityRole) -> usize {
        self.replicators
            .values()
            .filter(|r| r.bound_local_role() == local_role)
            .count()
    }

    #[must_use]
    pub fn entity_replicator_handles(&self) -> Vec<NetEntityHandle> {
        self.replicators.keys().copied().collect()
    }

    /// Whether the remote is the authority for `handle`.
    #[must_use]
    pub fn has_remote_authority(&self, handle: NetEntityHandle) -> bool {
        self.replicators
            .get(&handle)
            .is_some_and(|r| r.remote_role() == NetEntityRole::Authority)
    }

    #[must_use]
    pub fn entities_pending_activation(&self) -> usize {
        self.entities_pending_activation.len()
    }

    #[must_use]
    pub fn remote_entities_pending_creation(&self) -> usize {
        self.remote_entities_pending_creation.len()
    }

    #[must_use]
    pub fn replicators_pending_reset(&self) -> usize {
        self.replicators_pending_reset.len()
    }

    /// Drops all replicator state. Used at connection teardown.
    pub fn clear(&mut self) {
        self.replicators.clear();
        self.remote_entities_pending_creation.clear();
        self.entities_pending_activation.clear();
        self.replicators_pending_reset.clear();
        self.sent_packets.clear();
    }
}

impl std::fmt::Debug for EntityReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityReplicationManager")
            .field("mode", &self.mode)
            .field("remote_host", &self.remote_host)
            .field("replicators", &self.replicators.len())
            .field("has_window", &self.window.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{NetBindComponent, ReplicatedEntity};
    use crate::set::{EntityReplicationData, ReplicationSet};
    use crate::value::PropertyValue;
    use crate::world::LocalWorld;
    use schema::{ComponentDef, ComponentId, PropertyCodec, PropertyDef, PropertyId};

    const HASH: u64 = 0x5EED_CAFE;

    struct FixedWindow {
        set: ReplicationSet,
        cap: u32,
    }

    impl FixedWindow {
        fn boxed(entries: &[(NetEntityHandle, NetEntityRole, f32)], cap: u32) -> Box<Self> {
            let mut set = ReplicationSet::new();
            for (handle, role, priority) in entries {
                set.insert(*handle, EntityReplicationData::new(*role, *priority));
            }
            Box::new(Self { set, cap })
        }
    }

    impl ReplicationWindow for FixedWindow {
        fn replication_set_update_ready(&mut self) -> bool {
            true
        }

        fn replication_set(&self) -> &ReplicationSet {
            &self.set
        }

        fn max_entity_replicator_send_count(&self) -> u32 {
            self.cap
        }

        fn is_in_window(&self, handle: NetEntityHandle) -> Option<NetEntityRole> {
            self.set.get(handle).map(|data| data.role)
        }

        fn update_window(&mut self) {}
    }

    #[derive(Default)]
    struct Capture {
        next: u32,
        packets: Vec<(PacketId, Vec<u8>)>,
    }

    impl PacketSender for Capture {
        fn send_packet(&mut self, bytes: &[u8]) -> PacketId {
            self.next += 1;
            let id = PacketId::new(self.next);
            self.packets.push((id, bytes.to_vec()));
            id
        }
    }

    fn pid() -> PropertyId {
        PropertyId::new(1).unwrap()
    }

    fn prefab() -> PrefabEntityId {
        PrefabEntityId::new(7, 0)
    }

    fn world() -> LocalWorld {
        let mut world = LocalWorld::new();
        world.register_prefab(
            7,
            ComponentDef::new(ComponentId::new(1).unwrap())
                .property(PropertyDef::new(pid(), PropertyCodec::uint(16))),
        );
        world
    }

    fn server() -> EntityReplicationManager {
        EntityReplicationManager::new(
            UpdateMode::LocalServerToRemoteClient,
            "client",
            HASH,
            ReplicationConfig::for_testing(),
        )
    }

    fn client() -> EntityReplicationManager {
        EntityReplicationManager::new(
            UpdateMode::LocalClientToRemoteServer,
            "server",
            HASH,
            ReplicationConfig::for_testing(),
        )
    }

    fn spawn(world: &mut LocalWorld, value: u64) -> NetEntityHandle {
        let handle = world.spawn(prefab(), NetEntityRole::Authority).unwrap();
        set(world, handle, value);
        handle
    }

    fn set(world: &mut LocalWorld, handle: NetEntityHandle, value: u64) {
        world
            .entity_mut(handle)
            .unwrap()
            .set_property(pid(), PropertyValue::UInt(value))
            .unwrap();
    }

    fn value(world: &LocalWorld, handle: NetEntityHandle) -> Option<PropertyValue> {
        world.entity(handle).and_then(|e: &ReplicatedEntity| e.property(pid()))
    }

    fn deliver(
        to: &mut EntityReplicationManager,
        world: &mut LocalWorld,
        packets: &[(PacketId, Vec<u8>)],
        now: TimeMs,
    ) {
        for (id, bytes) in packets {
            to.handle_packet(*id, bytes, world, now).unwrap();
        }
    }

    #[test]
    fn window_adds_replicators() {
        let mut server_world = world();
        let a = spawn(&mut server_world, 1);
        let b = spawn(&mut server_world, 2);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(
                &[
                    (a, NetEntityRole::SimulatedProxy, 1.0),
                    (b, NetEntityRole::AutonomousProxy, 1.0),
                ],
                8,
            ),
            &server_world,
            TimeMs::ZERO,
        );
        assert_eq!(server.entity_replicator_handles(), vec![a, b]);
        assert_eq!(server.entity_replicator_count(NetEntityRole::Authority), 2);
        let replicator = server.entity_replicator(b).unwrap();
        assert_eq!(replicator.remote_role(), NetEntityRole::AutonomousProxy);
        assert!(replicator.subscriber().is_some());
        assert!(!server.has_remote_authority(a));
    }

    #[test]
    fn missing_entity_gets_no_replicator() {
        let server_world = world();
        let mut server = server();
        let ghost = NetEntityHandle::new(3, 0);
        assert!(server
            .add_entity_replicator(ghost, NetEntityRole::SimulatedProxy, &server_world)
            .is_none());
        assert_eq!(server.entity_replicator_handles(), Vec::new());
    }

    #[test]
    fn creation_reaches_client() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 42);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );

        let mut link = Capture::default();
        let stats = server
            .send_updates(&mut server_world, &mut link, TimeMs::new(10))
            .unwrap();
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.updates, 1);
        assert_eq!(server.remote_entities_pending_creation(), 1);

        let mut client_world = world();
        let mut client = client();
        deliver(&mut client, &mut client_world, &link.packets, TimeMs::new(20));
        assert!(client_world.contains(handle));
        assert!(!client_world.is_active(handle));
        assert_eq!(client.entities_pending_activation(), 1);
        assert_eq!(client.activate_pending_entities(&mut client_world), 1);
        assert!(client_world.is_active(handle));
        assert_eq!(value(&client_world, handle), Some(PropertyValue::UInt(42)));
        assert_eq!(
            client_world.component(handle).unwrap().net_entity_role(),
            NetEntityRole::SimulatedProxy
        );
        assert!(client.has_remote_authority(handle));
    }

    #[test]
    fn nothing_to_send_after_ack() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        server.on_packet_acked(link.packets[0].0);
        let stats = server.send_updates(&mut server_world, &mut link, TimeMs::new(1)).unwrap();
        assert_eq!(stats, SendStats::default());
        assert_eq!(server.remote_entities_pending_creation(), 0);
    }

    #[test]
    fn send_cap_keeps_highest_priority() {
        let mut server_world = world();
        let handles: Vec<_> = (0..5).map(|i| spawn(&mut server_world, i)).collect();
        let entries: Vec<_> = handles
            .iter()
            .enumerate()
            .map(|(i, h)| (*h, NetEntityRole::SimulatedProxy, i as f32))
            .collect();
        let mut server = server();
        server.set_replication_window(FixedWindow::boxed(&entries, 2), &server_world, TimeMs::ZERO);

        let list = server.generate_entity_update_list(&mut server_world);
        assert_eq!(list, vec![handles[4], handles[3]]);
    }

    #[test]
    fn autonomous_bypasses_send_cap() {
        let mut server_world = world();
        let proxy = spawn(&mut server_world, 1);
        let controlled = spawn(&mut server_world, 2);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(
                &[
                    (proxy, NetEntityRole::SimulatedProxy, 100.0),
                    (controlled, NetEntityRole::AutonomousProxy, 0.0),
                ],
                0,
            ),
            &server_world,
            TimeMs::ZERO,
        );
        let list = server.generate_entity_update_list(&mut server_world);
        assert_eq!(list, vec![controlled]);
    }

    #[test]
    fn pending_creation_is_capped() {
        let mut server_world = world();
        let handles: Vec<_> = (0..4).map(|i| spawn(&mut server_world, i)).collect();
        let entries: Vec<_> = handles
            .iter()
            .map(|h| (*h, NetEntityRole::SimulatedProxy, 1.0))
            .collect();
        let mut config = ReplicationConfig::for_testing();
        config.max_remote_entities_pending_creation = 2;
        let mut server = EntityReplicationManager::new(
            UpdateMode::LocalServerToRemoteClient,
            "client",
            HASH,
            config,
        );
        server.set_replication_window(FixedWindow::boxed(&entries, 16), &server_world, TimeMs::ZERO);

        assert_eq!(server.generate_entity_update_list(&mut server_world).len(), 2);
        assert_eq!(server.remote_entities_pending_creation(), 2);
    }

    #[test]
    fn schema_mismatch_is_fatal() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();

        let mut client = EntityReplicationManager::new(
            UpdateMode::LocalClientToRemoteServer,
            "server",
            HASH + 1,
            ReplicationConfig::for_testing(),
        );
        let (id, bytes) = &link.packets[0];
        let err = client
            .handle_packet(*id, bytes, &mut world(), TimeMs::ZERO)
            .unwrap_err();
        assert_eq!(
            err,
            ReplicationError::SchemaMismatch {
                expected: HASH + 1,
                found: HASH
            }
        );
    }

    #[test]
    fn garbage_packet_is_fatal() {
        let mut client = client();
        let err = client
            .handle_packet(PacketId::new(1), &[1, 2, 3], &mut world(), TimeMs::ZERO)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::Decode(_)));
    }

    #[test]
    fn reordered_packet_does_not_regress_state() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        set(&mut server_world, handle, 2);
        server.send_updates(&mut server_world, &mut link, TimeMs::new(1)).unwrap();
        assert_eq!(link.packets.len(), 2);

        let mut client_world = world();
        let mut client = client();
        let mut reversed = link.packets.clone();
        reversed.reverse();
        deliver(&mut client, &mut client_world, &reversed, TimeMs::new(5));
        assert_eq!(value(&client_world, handle), Some(PropertyValue::UInt(2)));
        assert_eq!(
            client
                .entity_replicator(handle)
                .and_then(EntityReplicator::subscriber)
                .map(PropertySubscriber::last_received_packet_id),
            Some(PacketId::new(2))
        );
    }

    #[test]
    fn client_update_for_proxy_disconnects() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );

        let message = EntityUpdateMessage::update(handle.raw(), NetEntityRole::Authority.to_raw(), &[]);
        let verdict =
            server.validate_update(&message, NetEntityRole::Authority, PacketId::new(1), handle);
        assert_eq!(verdict, UpdateValidation::DropMessageAndDisconnect);

        let messages = [message];
        let mut bytes = vec![0; update_packet_size(&messages)];
        encode_update_packet(HASH, &messages, &mut bytes).unwrap();
        let err = server
            .handle_packet(PacketId::new(1), &bytes, &mut server_world, TimeMs::ZERO)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::UnexpectedUpdate { entity, .. } if entity == handle));
    }

    #[test]
    fn client_delete_disconnects() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::AutonomousProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let message = EntityUpdateMessage::delete(handle.raw(), NetEntityRole::Authority.to_raw(), false);
        assert_eq!(
            server.validate_update(&message, NetEntityRole::Authority, PacketId::new(1), handle),
            UpdateValidation::DropMessageAndDisconnect
        );
    }

    #[test]
    fn server_to_server_drops_updates_for_owned_entities() {
        let mut world_a = world();
        let handle = spawn(&mut world_a, 1);
        let mut peer = EntityReplicationManager::new(
            UpdateMode::LocalServerToRemoteServer,
            "peer",
            HASH,
            ReplicationConfig::for_testing(),
        );
        peer.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &world_a,
            TimeMs::ZERO,
        );
        let message = EntityUpdateMessage::update(handle.raw(), NetEntityRole::SimulatedProxy.to_raw(), &[]);
        assert_eq!(
            peer.validate_update(&message, NetEntityRole::SimulatedProxy, PacketId::new(1), handle),
            UpdateValidation::DropMessage
        );
        let other = NetEntityHandle::new(40, 0);
        let message = EntityUpdateMessage::update(other.raw(), NetEntityRole::SimulatedProxy.to_raw(), &[]);
        assert_eq!(
            peer.validate_update(&message, NetEntityRole::SimulatedProxy, PacketId::new(1), other),
            UpdateValidation::HandleMessage
        );
    }

    #[test]
    fn invalid_role_is_fatal() {
        let message = EntityUpdateMessage::update(1, 0, &[]).with_prefab(prefab());
        let messages = [message];
        let mut bytes = vec![0; update_packet_size(&messages)];
        encode_update_packet(HASH, &messages, &mut bytes).unwrap();
        let err = client()
            .handle_packet(PacketId::new(1), &bytes, &mut world(), TimeMs::ZERO)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidRole { raw: 0, .. }));
    }

    #[test]
    fn failed_creation_leaves_no_entity() {
        let handle = NetEntityHandle::new(3, 0);
        // Mask selects the property but the value is missing.
        let message = EntityUpdateMessage::update(
            handle.raw(),
            NetEntityRole::SimulatedProxy.to_raw(),
            &[0x01],
        )
        .with_prefab(prefab());
        let messages = [message];
        let mut bytes = vec![0; update_packet_size(&messages)];
        encode_update_packet(HASH, &messages, &mut bytes).unwrap();

        let mut client = client();
        let mut client_world = world();
        let err = client
            .handle_packet(PacketId::new(1), &bytes, &mut client_world, TimeMs::ZERO)
            .unwrap_err();
        assert!(matches!(err, ReplicationError::PropertyDeserialize { entity, .. } if entity == handle));
        assert!(!client_world.contains(handle));
        assert!(client.entity_replicator(handle).is_none());
        assert_eq!(client.entities_pending_activation(), 0);
    }

    #[test]
    fn leaving_window_deletes_after_deadline() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 9);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut client_world = world();
        let mut client = client();

        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        deliver(&mut client, &mut client_world, &link.packets, TimeMs::ZERO);
        server.on_packet_acked(PacketId::new(1));

        server.set_replication_window(FixedWindow::boxed(&[], 8), &server_world, TimeMs::new(10));
        let deadline = server.entity_replicator(handle).unwrap().pending_removal_deadline();
        assert_eq!(deadline, Some(TimeMs::new(110)));

        let mut link = Capture { next: 1, ..Capture::default() };
        let stats = server.send_updates(&mut server_world, &mut link, TimeMs::new(50)).unwrap();
        assert_eq!(stats.deletes, 0);
        let stats = server.send_updates(&mut server_world, &mut link, TimeMs::new(110)).unwrap();
        assert_eq!(stats.deletes, 1);
        assert!(server.entity_replicator(handle).unwrap().is_marked_for_removal());

        deliver(&mut client, &mut client_world, &link.packets, TimeMs::new(120));
        assert!(!client_world.contains(handle));
        assert!(client
            .entity_replicator(handle)
            .and_then(EntityReplicator::subscriber)
            .is_some_and(PropertySubscriber::is_deleting));

        server.on_packet_acked(link.packets[0].0);
        server.clear_removed_replicators(&mut server_world, TimeMs::new(130));
        assert!(server.entity_replicator(handle).is_none());
        assert!(server_world.contains(handle));

        client.clear_removed_replicators(&mut client_world, TimeMs::new(200));
        assert!(client.entity_replicator(handle).is_some());
        client.clear_removed_replicators(&mut client_world, TimeMs::new(320));
        assert!(client.entity_replicator(handle).is_none());
    }

    #[test]
    fn migrated_entity_is_deleted_but_kept_remotely() {
        let mut server_world = world();
        let mut client_world = world();
        let handle = spawn(&mut server_world, 9);
        let mut server = server();
        let mut client = client();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        deliver(&mut client, &mut client_world, &link.packets, TimeMs::ZERO);
        server.on_packet_acked(PacketId::new(1));

        // The connection to the new owner ignores the hand-off.
        server.on_entity_migrated(handle, "client", &server_world);
        assert!(!server.entity_replicator(handle).unwrap().is_marked_for_removal());

        server.set_replication_window(FixedWindow::boxed(&[], 8), &server_world, TimeMs::new(10));
        server.on_entity_migrated(handle, "other-server", &server_world);
        let replicator = server.entity_replicator(handle).unwrap();
        assert!(replicator.was_migrated());
        assert!(replicator.is_marked_for_removal());
        assert_eq!(replicator.pending_removal_deadline(), None);

        let mut link = Capture { next: 1, ..Capture::default() };
        let stats = server.send_updates(&mut server_world, &mut link, TimeMs::new(20)).unwrap();
        assert_eq!(stats.deletes, 1);
        let packet = decode_packet(&link.packets[0].1, &Limits::default()).unwrap();
        let PacketBody::EntityUpdates(messages) = packet.body else {
            panic!("expected entity updates");
        };
        assert!(messages[0].is_delete && messages[0].was_migrated);

        deliver(&mut client, &mut client_world, &link.packets, TimeMs::new(20));
        assert!(client_world.contains(handle));
        assert!(client.entity_replicator(handle).unwrap().was_migrated());
        client.clear_removed_replicators(&mut client_world, TimeMs::new(1000));
        assert!(client.entity_replicator(handle).is_none());
        assert!(client_world.contains(handle));
    }

    #[test]
    fn migrated_entity_still_in_window_is_rebound() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 9);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        server_world
            .entity_mut(handle)
            .unwrap()
            .set_net_entity_role(NetEntityRole::Server);
        server.on_entity_migrated(handle, "other-server", &server_world);
        let replicator = server.entity_replicator(handle).unwrap();
        assert_eq!(replicator.bound_local_role(), NetEntityRole::Server);
        assert!(!replicator.is_marked_for_removal());
        assert!(!replicator.was_migrated());
    }

    #[test]
    fn unreported_packets_expire_behind_acks() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 9);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        assert_eq!(server.packets_in_flight(), 1);

        set(&mut server_world, handle, 10);
        let mut link = Capture { next: 100, ..Capture::default() };
        server.send_updates(&mut server_world, &mut link, TimeMs::new(1)).unwrap();
        assert_eq!(server.packets_in_flight(), 2);
        server.on_packet_acked(PacketId::new(101));
        assert_eq!(server.packets_in_flight(), 1, "packet 1 is still inside the window");

        set(&mut server_world, handle, 11);
        let mut link = Capture { next: 2000, ..Capture::default() };
        server.send_updates(&mut server_world, &mut link, TimeMs::new(2)).unwrap();
        server.on_packet_acked(PacketId::new(2001));
        assert_eq!(server.packets_in_flight(), 0);
    }

    #[test]
    fn returning_to_window_cancels_removal() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 9);
        let mut server = server();
        let entry = [(handle, NetEntityRole::SimulatedProxy, 1.0)];
        server.set_replication_window(FixedWindow::boxed(&entry, 8), &server_world, TimeMs::ZERO);
        server.set_replication_window(FixedWindow::boxed(&[], 8), &server_world, TimeMs::new(10));
        assert!(server.entity_replicator(handle).unwrap().pending_removal_deadline().is_some());
        server.set_replication_window(FixedWindow::boxed(&entry, 8), &server_world, TimeMs::new(20));
        assert_eq!(server.entity_replicator(handle).unwrap().pending_removal_deadline(), None);
    }

    #[test]
    fn destroyed_entity_sends_delete() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 9);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        server.on_packet_acked(PacketId::new(1));
        server_world.remove_entity(handle);
        let stats = server.send_updates(&mut server_world, &mut link, TimeMs::new(1)).unwrap();
        assert_eq!(stats.deletes, 1);
    }

    #[test]
    fn lost_creation_is_resent() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 5);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut lost = Capture::default();
        server.send_updates(&mut server_world, &mut lost, TimeMs::ZERO).unwrap();
        server.on_packet_lost(PacketId::new(1));

        let mut link = Capture { next: 1, ..Capture::default() };
        server.send_updates(&mut server_world, &mut link, TimeMs::new(1)).unwrap();
        let mut client_world = world();
        let mut client = client();
        deliver(&mut client, &mut client_world, &link.packets, TimeMs::new(2));
        assert_eq!(value(&client_world, handle), Some(PropertyValue::UInt(5)));
    }

    #[test]
    fn unknown_entity_without_prefab_requests_reset() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        server.on_packet_acked(PacketId::new(1));
        set(&mut server_world, handle, 77);
        let mut link = Capture { next: 1, ..Capture::default() };
        server.send_updates(&mut server_world, &mut link, TimeMs::new(1)).unwrap();

        // A client that never saw the creation.
        let mut client_world = world();
        let mut client = client();
        deliver(&mut client, &mut client_world, &link.packets, TimeMs::new(2));
        assert!(!client_world.contains(handle));
        assert_eq!(client.replicators_pending_reset(), 1);

        let mut back = Capture::default();
        let stats = client.send_updates(&mut client_world, &mut back, TimeMs::new(3)).unwrap();
        assert_eq!(stats.resets, 1);
        assert_eq!(client.replicators_pending_reset(), 0);

        deliver(&mut server, &mut server_world, &back.packets, TimeMs::new(4));
        let mut link = Capture { next: 2, ..Capture::default() };
        server.send_updates(&mut server_world, &mut link, TimeMs::new(5)).unwrap();
        deliver(&mut client, &mut client_world, &link.packets, TimeMs::new(6));
        assert_eq!(value(&client_world, handle), Some(PropertyValue::UInt(77)));
    }

    #[test]
    fn autonomous_client_pushes_state_to_server() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::AutonomousProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        let mut link = Capture::default();
        server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();

        let mut client_world = world();
        let mut client = client();
        deliver(&mut client, &mut client_world, &link.packets, TimeMs::ZERO);
        client.activate_pending_entities(&mut client_world);
        assert_eq!(
            client_world.component(handle).unwrap().net_entity_role(),
            NetEntityRole::AutonomousProxy
        );

        // Nothing to echo back right after creation.
        let mut back = Capture::default();
        let stats = client.send_updates(&mut client_world, &mut back, TimeMs::new(1)).unwrap();
        assert_eq!(stats.updates, 0);

        set(&mut client_world, handle, 300);
        let stats = client.send_updates(&mut client_world, &mut back, TimeMs::new(2)).unwrap();
        assert_eq!(stats.updates, 1);
        deliver(&mut server, &mut server_world, &back.packets, TimeMs::new(3));
        assert_eq!(value(&server_world, handle), Some(PropertyValue::UInt(300)));
    }

    #[test]
    fn oversized_message_goes_alone() {
        let mut server_world = world();
        let handles: Vec<_> = (0..3).map(|i| spawn(&mut server_world, i)).collect();
        let entries: Vec<_> = handles
            .iter()
            .map(|h| (*h, NetEntityRole::SimulatedProxy, 1.0))
            .collect();
        let mut config = ReplicationConfig::for_testing();
        config.connection_mtu = 28 + HEADER_SIZE + 1;
        let mut server = EntityReplicationManager::new(
            UpdateMode::LocalServerToRemoteClient,
            "client",
            HASH,
            config,
        );
        server.set_replication_window(FixedWindow::boxed(&entries, 8), &server_world, TimeMs::ZERO);
        let mut link = Capture::default();
        let stats = server.send_updates(&mut server_world, &mut link, TimeMs::ZERO).unwrap();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.updates, 3);
    }

    #[test]
    fn clear_drops_everything() {
        let mut server_world = world();
        let handle = spawn(&mut server_world, 1);
        let mut server = server();
        server.set_replication_window(
            FixedWindow::boxed(&[(handle, NetEntityRole::SimulatedProxy, 1.0)], 8),
            &server_world,
            TimeMs::ZERO,
        );
        server.clear();
        assert!(server.entity_replicator_handles().is_empty());
        assert!(server.replication_window().is_some());
    }
}
