//! Server and clients sharing one process.
//!
//! The server owns every entity and keeps one replication manager per
//! client, each with a spatial window centered on that client's pawn. A
//! client predicts its pawn from local input, pushes the predicted state up,
//! and replays unacknowledged inputs whenever the server's echo arrives.

use std::collections::BTreeSet;
use std::rc::Rc;

use anyhow::{Context, Result};
use repgraph::{
    SharedSpatialIndex, SpatialIndex, SpatialReplicationWindow, Vec3, WindowConfig, WindowView,
};
use replication::{
    ClientInputId, EntityReplicationManager, EntityWorld, HostFrameId, LocalWorld,
    NetBindComponent, NetEntityHandle, NetEntityRole, NetworkInput, NetworkInputHistory,
    PropertyValue, ReplicatedEntity, ReplicationWindow, SendStats, TimeMs, UpdateMode,
};
use serde::Serialize;
use schema::{ComponentDef, ComponentId, PropertyCodec, PropertyDef, PropertyId, Schema};
use wire::PrefabEntityId;

use crate::config::{LinkConfig, SimConfig};
use crate::link::{Link, LinkStats, Rng};

pub const PAWN_PREFAB: u32 = 1;
pub const NPC_PREFAB: u32 = 2;

const PAWN_COMPONENT: u16 = 1;
const NPC_COMPONENT: u16 = 2;
const PROP_POS_X: u16 = 1;
const PROP_POS_Y: u16 = 2;
const PROP_HEALTH: u16 = 3;
const PROP_LAST_INPUT: u16 = 4;

/// Largest per-axis move of one input or one NPC step.
const MAX_STEP: i64 = 3;
const FULL_HEALTH: u64 = 100;

fn component_id(value: u16) -> ComponentId {
    ComponentId::new(value).expect("component id must be non-zero")
}

fn property_id(value: u16) -> PropertyId {
    PropertyId::new(value).expect("property id must be non-zero")
}

pub fn pawn_def() -> ComponentDef {
    ComponentDef::new(component_id(PAWN_COMPONENT))
        .property(PropertyDef::new(property_id(PROP_POS_X), PropertyCodec::var_sint()))
        .property(PropertyDef::new(property_id(PROP_POS_Y), PropertyCodec::var_sint()))
        .property(PropertyDef::new(property_id(PROP_HEALTH), PropertyCodec::uint(8)))
        .property(PropertyDef::new(property_id(PROP_LAST_INPUT), PropertyCodec::uint(16)))
}

pub fn npc_def() -> ComponentDef {
    ComponentDef::new(component_id(NPC_COMPONENT))
        .property(PropertyDef::new(property_id(PROP_POS_X), PropertyCodec::var_sint()))
        .property(PropertyDef::new(property_id(PROP_POS_Y), PropertyCodec::var_sint()))
        .property(PropertyDef::new(property_id(PROP_HEALTH), PropertyCodec::uint(8)))
}

pub fn sim_schema() -> Schema {
    Schema::new(vec![pawn_def(), npc_def()]).expect("sim schema must be valid")
}

fn sim_world() -> LocalWorld {
    let mut world = LocalWorld::new();
    world.register_prefab(PAWN_PREFAB, pawn_def());
    world.register_prefab(NPC_PREFAB, npc_def());
    world
}

/// Movement carried by one client input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveInput {
    pub dx: i64,
    pub dy: i64,
}

type Position = (i64, i64);

fn step(position: Position, input: MoveInput, extent: i64) -> Position {
    (
        (position.0 + input.dx).clamp(-extent, extent),
        (position.1 + input.dy).clamp(-extent, extent),
    )
}

fn position(entity: &ReplicatedEntity) -> Position {
    match (
        entity.property(property_id(PROP_POS_X)),
        entity.property(property_id(PROP_POS_Y)),
    ) {
        (Some(PropertyValue::SInt(x)), Some(PropertyValue::SInt(y))) => (x, y),
        _ => (0, 0),
    }
}

fn set_position(entity: &mut ReplicatedEntity, position: Position) -> Result<()> {
    entity.set_property(property_id(PROP_POS_X), PropertyValue::SInt(position.0))?;
    entity.set_property(property_id(PROP_POS_Y), PropertyValue::SInt(position.1))?;
    Ok(())
}

fn to_vec3(position: Position) -> Vec3 {
    Vec3::new(position.0 as f32, position.1 as f32, 0.0)
}

/// Totals across the whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub updates: u64,
    pub deletes: u64,
    pub resets: u64,
    pub npcs_spawned: u64,
    pub npcs_despawned: u64,
    pub inputs: u64,
    pub mispredictions: u64,
    pub max_input_history: usize,
}

impl RunStats {
    fn add(&mut self, stats: SendStats) {
        self.updates += stats.updates as u64;
        self.deletes += stats.deletes as u64;
        self.resets += stats.resets as u64;
    }
}

/// Client state that disagrees with the server after settling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Divergence {
    /// Visible on the server side but absent or inactive on the client.
    pub missing: u64,
    /// Present on the client but outside its window.
    pub extra: u64,
    pub mismatched: u64,
    pub pending_inputs: u64,
}

impl Divergence {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.missing + self.extra + self.mismatched + self.pending_inputs
    }
}

/// The server's last word on a client's pawn.
#[derive(Debug, Clone, Copy)]
struct ServerView {
    position: Position,
    input: ClientInputId,
}

struct Client {
    index: u32,
    pawn: NetEntityHandle,
    /// The server's manager for this connection.
    server_side: EntityReplicationManager,
    manager: EntityReplicationManager,
    world: LocalWorld,
    down: Link,
    up: Link,
    rng: Rng,
    inputs: NetworkInputHistory<NetworkInput<MoveInput>>,
    next_input: ClientInputId,
    confirmed: Option<ServerView>,
    predicted: Position,
}

impl Client {
    fn controls_pawn(&self) -> bool {
        self.world.is_active(self.pawn)
            && self
                .world
                .entity(self.pawn)
                .is_some_and(|e| e.net_entity_role() == NetEntityRole::AutonomousProxy)
    }

    fn predict(
        &mut self,
        frame: HostFrameId,
        now: TimeMs,
        extent: i64,
        stats: &mut RunStats,
    ) -> Result<()> {
        if self.confirmed.is_none() || !self.controls_pawn() {
            return Ok(());
        }
        let Some(entity) = self.world.entity_mut(self.pawn) else {
            return Ok(());
        };
        let input = MoveInput {
            dx: self.rng.range_i64(-MAX_STEP, MAX_STEP),
            dy: self.rng.range_i64(-MAX_STEP, MAX_STEP),
        };
        self.next_input = self.next_input.next();
        self.predicted = step(self.predicted, input, extent);
        set_position(entity, self.predicted)?;
        entity.set_property(
            property_id(PROP_LAST_INPUT),
            PropertyValue::UInt(u64::from(self.next_input.raw())),
        )?;
        self.inputs
            .push_back(NetworkInput::new(self.next_input, frame, now, input));
        stats.inputs += 1;
        stats.max_input_history = stats.max_input_history.max(self.inputs.size());
        Ok(())
    }

    /// Folds the server's latest view of the pawn into the prediction.
    ///
    /// Applying the server's echo overwrites the pawn's values with older
    /// ones, so the predicted position and newest input id are written back
    /// before the next send.
    fn reconcile(&mut self, extent: i64, stats: &mut RunStats) -> Result<()> {
        if !self.world.is_active(self.pawn) {
            self.confirmed = None;
            self.inputs.clear();
            return Ok(());
        }
        let Some(entity) = self.world.entity_mut(self.pawn) else {
            return Ok(());
        };
        let changes = entity.drain_changes();
        let Some(mut view) = self.confirmed else {
            let input = match entity.property(property_id(PROP_LAST_INPUT)) {
                Some(PropertyValue::UInt(raw)) => ClientInputId::new(raw as u16),
                _ => ClientInputId::new(0),
            };
            self.confirmed = Some(ServerView {
                position: position(entity),
                input,
            });
            self.predicted = position(entity);
            self.next_input = input;
            return Ok(());
        };
        if changes.is_empty() {
            return Ok(());
        }
        for change in &changes {
            match (change.property.get(), change.value) {
                (PROP_POS_X, PropertyValue::SInt(x)) => view.position.0 = x,
                (PROP_POS_Y, PropertyValue::SInt(y)) => view.position.1 = y,
                (PROP_LAST_INPUT, PropertyValue::UInt(raw)) => {
                    view.input = ClientInputId::new(raw as u16);
                }
                _ => {}
            }
        }
        self.confirmed = Some(view);

        while !self.inputs.is_empty()
            && !self.inputs.front().client_input_id.is_newer_than(view.input)
        {
            self.inputs.pop_front();
        }
        let replayed = self
            .inputs
            .iter()
            .fold(view.position, |at, input| step(at, input.payload, extent));
        if replayed != self.predicted {
            log::debug!(
                "client {}: misprediction {:?} -> {:?}",
                self.index,
                self.predicted,
                replayed
            );
            stats.mispredictions += 1;
            self.predicted = replayed;
        }

        if position(entity) != replayed {
            set_position(entity, replayed)?;
        }
        let newest = PropertyValue::UInt(u64::from(self.next_input.raw()));
        if entity.property(property_id(PROP_LAST_INPUT)) != Some(newest) {
            entity.set_property(property_id(PROP_LAST_INPUT), newest)?;
        }
        Ok(())
    }
}

/// A full server/client run.
pub struct Simulation {
    config: SimConfig,
    rng: Rng,
    world: LocalWorld,
    index: SharedSpatialIndex,
    npcs: Vec<NetEntityHandle>,
    clients: Vec<Client>,
    tick: u64,
    stats: RunStats,
}

impl Simulation {
    pub fn new(config: SimConfig) -> Result<Self> {
        config.validate()?;
        let hash = schema::schema_hash(&sim_schema());
        let mut rng = Rng::new(config.seed);
        let mut world = sim_world();
        let index = SpatialIndex::shared(config.max_entities());
        let extent = config.arena_half_extent;

        let mut npcs = Vec::with_capacity(config.npcs as usize);
        for _ in 0..config.npcs {
            npcs.push(spawn(&mut world, &index, &mut rng, NPC_PREFAB, extent)?);
        }

        let window_config = WindowConfig {
            max_entity_replicator_send_count: config.max_entity_replicator_send_count,
            update_interval_ticks: config.window_update_interval_ticks,
        };
        let mut clients = Vec::with_capacity(config.clients as usize);
        for index_in_run in 0..config.clients {
            let pawn = spawn(&mut world, &index, &mut rng, PAWN_PREFAB, extent)?;
            let window = SpatialReplicationWindow::new(
                window_config,
                WindowView::new(Vec3::default(), config.view_radius),
                Rc::clone(&index),
            )
            .with_controlled_entity(pawn);
            let mut server_side = EntityReplicationManager::new(
                UpdateMode::LocalServerToRemoteClient,
                format!("client-{index_in_run}"),
                hash,
                config.replication.clone(),
            );
            server_side.set_replication_window(Box::new(window), &world, TimeMs::ZERO);

            let seed = config
                .seed
                .wrapping_add(u64::from(index_in_run + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
            clients.push(Client {
                index: index_in_run,
                pawn,
                server_side,
                manager: EntityReplicationManager::new(
                    UpdateMode::LocalClientToRemoteServer,
                    "server",
                    hash,
                    config.replication.clone(),
                ),
                world: sim_world(),
                down: Link::new(config.link, seed),
                up: Link::new(config.link, seed ^ 0xA5A5_A5A5),
                rng: Rng::new(seed.rotate_left(17)),
                inputs: NetworkInputHistory::new(),
                next_input: ClientInputId::new(0),
                confirmed: None,
                predicted: (0, 0),
            });
        }
        log::info!(
            "simulation: {} clients, {} npcs, schema hash {hash:#018x}",
            config.clients,
            config.npcs
        );

        Ok(Self {
            config,
            rng,
            world,
            index,
            npcs,
            clients,
            tick: 0,
            stats: RunStats::default(),
        })
    }

    /// Chaotic ticks followed by a quiet, lossless settle phase.
    pub fn run(&mut self) -> Result<()> {
        for _ in 0..self.config.ticks {
            self.step(true)?;
        }
        for client in &mut self.clients {
            client.down.set_config(LinkConfig::perfect());
            client.up.set_config(LinkConfig::perfect());
        }
        for _ in 0..self.config.settle_ticks {
            self.step(false)?;
        }
        for client in &self.clients {
            if !client.down.is_idle() || !client.up.is_idle() {
                log::warn!("client {}: packets still in flight after settling", client.index);
            }
        }
        Ok(())
    }

    /// Advances one tick. Inputs and NPC movement only happen when `active`.
    pub fn step(&mut self, active: bool) -> Result<()> {
        let tick = self.tick;
        let now = TimeMs::new(tick * self.config.tick_ms);
        let extent = self.config.arena_half_extent;

        if active {
            let frame = HostFrameId::new(tick as u32);
            for client in &mut self.clients {
                client.predict(frame, now, extent, &mut self.stats)?;
            }
            self.step_npcs()?;
        }

        // Client to server.
        for client in &mut self.clients {
            let sent = client
                .manager
                .send_updates(&mut client.world, &mut client.up, now)
                .with_context(|| format!("client {} send", client.index))?;
            self.stats.add(sent);
            for id in client.up.pump(tick) {
                client.manager.on_packet_lost(id);
            }
            for datagram in client.up.deliver(tick) {
                client
                    .server_side
                    .handle_packet(datagram.id, &datagram.bytes, &mut self.world, now)
                    .with_context(|| format!("server handling packet from client {}", client.index))?;
                client.manager.on_packet_acked(datagram.id);
            }
            if let Some(entity) = self.world.entity(client.pawn) {
                self.index
                    .borrow_mut()
                    .update_entity(client.pawn, to_vec3(position(entity)));
            }
        }

        // Server to clients.
        for client in &mut self.clients {
            client.server_side.update_window(&self.world, now);
            let sent = client
                .server_side
                .send_updates(&mut self.world, &mut client.down, now)
                .with_context(|| format!("server send to client {}", client.index))?;
            self.stats.add(sent);
            for id in client.down.pump(tick) {
                client.server_side.on_packet_lost(id);
            }
            for datagram in client.down.deliver(tick) {
                client
                    .manager
                    .handle_packet(datagram.id, &datagram.bytes, &mut client.world, now)
                    .with_context(|| format!("client {} handling server packet", client.index))?;
                client.server_side.on_packet_acked(datagram.id);
            }
            client.manager.activate_pending_entities(&mut client.world);
            client.reconcile(extent, &mut self.stats)?;

            client
                .server_side
                .clear_removed_replicators(&mut self.world, now);
            client
                .manager
                .clear_removed_replicators(&mut client.world, now);
        }

        if tick % 60 == 0 {
            for client in &self.clients {
                if let Some(window) = client.server_side.replication_window() {
                    window.debug_draw();
                }
            }
        }
        self.tick += 1;
        Ok(())
    }

    fn step_npcs(&mut self) -> Result<()> {
        let extent = self.config.arena_half_extent;
        for handle in &self.npcs {
            let Some(entity) = self.world.entity_mut(*handle) else {
                continue;
            };
            if self.rng.chance(50) {
                let input = MoveInput {
                    dx: self.rng.range_i64(-MAX_STEP, MAX_STEP),
                    dy: self.rng.range_i64(-MAX_STEP, MAX_STEP),
                };
                let next = step(position(entity), input, extent);
                set_position(entity, next)?;
                self.index.borrow_mut().update_entity(*handle, to_vec3(next));
            }
            if self.rng.chance(2) {
                let health = self.rng.range_i64(0, FULL_HEALTH as i64) as u64;
                entity.set_property(property_id(PROP_HEALTH), PropertyValue::UInt(health))?;
            }
        }

        if !self.npcs.is_empty() && self.rng.chance(self.config.npc_churn_percent) {
            let victim = self.npcs.swap_remove(self.rng.next_u32() as usize % self.npcs.len());
            log::debug!("despawning npc {victim}");
            self.world.remove_entity(victim);
            self.index.borrow_mut().remove_entity(victim);
            self.stats.npcs_despawned += 1;

            let spawned = spawn(&mut self.world, &self.index, &mut self.rng, NPC_PREFAB, extent)?;
            log::debug!("spawned npc {spawned}");
            self.npcs.push(spawned);
            self.stats.npcs_spawned += 1;
        }
        Ok(())
    }

    /// Compares every client against the server's view of its window.
    #[must_use]
    pub fn divergence(&self) -> Divergence {
        let mut divergence = Divergence::default();
        for client in &self.clients {
            let Some(window) = client.server_side.replication_window() else {
                continue;
            };
            let expected: BTreeSet<NetEntityHandle> = window
                .replication_set()
                .iter()
                .map(|(handle, _)| *handle)
                .filter(|handle| self.world.contains(*handle))
                .collect();

            for handle in client.world.handles() {
                if !expected.contains(&handle) {
                    log::warn!("client {}: {handle} outside its window", client.index);
                    divergence.extra += 1;
                }
            }
            for handle in &expected {
                match (self.world.entity(*handle), client.world.entity(*handle)) {
                    (Some(server), Some(remote))
                        if server.values() == remote.values()
                            && client.world.is_active(*handle) => {}
                    (Some(_), Some(_)) => {
                        log::warn!("client {}: {handle} diverged", client.index);
                        divergence.mismatched += 1;
                    }
                    _ => {
                        log::warn!("client {}: {handle} missing", client.index);
                        divergence.missing += 1;
                    }
                }
            }
            divergence.pending_inputs += client.inputs.size() as u64;
        }
        divergence
    }

    #[must_use]
    pub const fn stats(&self) -> RunStats {
        self.stats
    }

    #[must_use]
    pub const fn ticks_run(&self) -> u64 {
        self.tick
    }

    /// Link totals, server to client then client to server.
    #[must_use]
    pub fn link_stats(&self) -> (LinkStats, LinkStats) {
        let mut down = LinkStats::default();
        let mut up = LinkStats::default();
        for client in &self.clients {
            accumulate(&mut down, client.down.stats());
            accumulate(&mut up, client.up.stats());
        }
        (down, up)
    }

    /// Every packet size sent in either direction.
    #[must_use]
    pub fn packet_sizes(&self) -> Vec<u64> {
        self.clients
            .iter()
            .flat_map(|c| c.down.packet_sizes().iter().chain(c.up.packet_sizes()))
            .copied()
            .collect()
    }
}

fn accumulate(total: &mut LinkStats, stats: LinkStats) {
    total.sent += stats.sent;
    total.bytes += stats.bytes;
    total.lost += stats.lost;
    total.duplicated += stats.duplicated;
}

fn spawn(
    world: &mut LocalWorld,
    index: &SharedSpatialIndex,
    rng: &mut Rng,
    prefab: u32,
    extent: i64,
) -> Result<NetEntityHandle> {
    let handle = world
        .spawn(PrefabEntityId::new(prefab, 0), NetEntityRole::Authority)
        .with_context(|| format!("spawn prefab {prefab}"))?;
    let at = (rng.range_i64(-extent, extent), rng.range_i64(-extent, extent));
    if let Some(entity) = world.entity_mut(handle) {
        set_position(entity, at)?;
        entity.set_property(property_id(PROP_HEALTH), PropertyValue::UInt(FULL_HEALTH))?;
    }
    index.borrow_mut().update_entity(handle, to_vec3(at));
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use replication::ReplicationConfig;

    fn small(seed: u64, link: LinkConfig) -> SimConfig {
        SimConfig {
            clients: 2,
            npcs: 12,
            ticks: 120,
            settle_ticks: 60,
            seed,
            arena_half_extent: 60,
            view_radius: 40.0,
            max_entity_replicator_send_count: 6,
            window_update_interval_ticks: 2,
            npc_churn_percent: 10,
            link,
            replication: ReplicationConfig::for_testing(),
            ..SimConfig::default()
        }
    }

    #[test]
    fn perfect_link_has_no_divergence() {
        let mut sim = Simulation::new(small(1, LinkConfig::perfect())).unwrap();
        sim.run().unwrap();
        assert_eq!(sim.divergence(), Divergence::default());
        assert!(sim.stats().inputs > 0);
        assert_eq!(sim.stats().mispredictions, 0);
        assert_eq!(sim.ticks_run(), 180);
    }

    #[test]
    fn lossy_link_converges_after_settle() {
        let link = LinkConfig {
            loss_percent: 20,
            duplicate_percent: 10,
            max_delay_ticks: 3,
        };
        for seed in [2, 3, 4] {
            let mut sim = Simulation::new(small(seed, link)).unwrap();
            sim.run().unwrap();
            assert_eq!(sim.divergence(), Divergence::default(), "seed {seed}");
            assert!(sim.link_stats().0.lost > 0);
        }
    }

    #[test]
    fn same_seed_same_traffic() {
        let config = small(9, LinkConfig::default());
        let mut a = Simulation::new(config.clone()).unwrap();
        let mut b = Simulation::new(config).unwrap();
        a.run().unwrap();
        b.run().unwrap();
        assert_eq!(a.packet_sizes(), b.packet_sizes());
        assert_eq!(a.stats(), b.stats());
    }

    #[test]
    fn step_clamps_to_arena() {
        assert_eq!(step((9, -9), MoveInput { dx: 3, dy: -3 }, 10), (10, -10));
        assert_eq!(step((0, 0), MoveInput { dx: 2, dy: 1 }, 10), (2, 1));
    }

    #[test]
    fn schema_is_valid() {
        let schema = sim_schema();
        assert_eq!(schema::schema_hash(&schema), schema::schema_hash(&sim_schema()));
    }
}
