use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use replication::{
    EntityReplicationData, EntityReplicationManager, LocalWorld, NetEntityHandle, NetEntityRole,
    PacketSender, PropertyValue, ReplicationConfig, ReplicationSet, ReplicationWindow, TimeMs,
    UpdateMode,
};
use schema::{ComponentDef, ComponentId, PropertyCodec, PropertyDef, PropertyId};
use wire::{PacketId, PrefabEntityId};

const HASH: u64 = 0xBE7C;
const ENTITIES: u32 = 512;

struct FullWindow {
    set: ReplicationSet,
}

impl ReplicationWindow for FullWindow {
    fn replication_set_update_ready(&mut self) -> bool {
        false
    }

    fn replication_set(&self) -> &ReplicationSet {
        &self.set
    }

    fn max_entity_replicator_send_count(&self) -> u32 {
        u32::MAX
    }

    fn is_in_window(&self, handle: NetEntityHandle) -> Option<NetEntityRole> {
        self.set.get(handle).map(|data| data.role)
    }

    fn update_window(&mut self) {}
}

#[derive(Default)]
struct Sink {
    next: u32,
    packets: Vec<(PacketId, Vec<u8>)>,
}

impl PacketSender for Sink {
    fn send_packet(&mut self, bytes: &[u8]) -> PacketId {
        self.next += 1;
        let id = PacketId::new(self.next);
        self.packets.push((id, bytes.to_vec()));
        id
    }
}

fn pid(raw: u16) -> PropertyId {
    PropertyId::new(raw).unwrap()
}

fn world() -> LocalWorld {
    let mut world = LocalWorld::new();
    world.register_prefab(
        1,
        ComponentDef::new(ComponentId::new(1).unwrap())
            .property(PropertyDef::new(pid(1), PropertyCodec::var_sint()))
            .property(PropertyDef::new(pid(2), PropertyCodec::var_sint()))
            .property(PropertyDef::new(pid(3), PropertyCodec::uint(8)))
            .property(PropertyDef::new(pid(4), PropertyCodec::bool())),
    );
    world
}

/// A server that has sent creation for every entity but heard nothing back.
fn created() -> (LocalWorld, EntityReplicationManager, Vec<NetEntityHandle>, Sink) {
    let mut world = world();
    let mut set = ReplicationSet::new();
    let handles: Vec<_> = (0..ENTITIES)
        .map(|i| {
            let handle = world
                .spawn(PrefabEntityId::new(1, 0), NetEntityRole::Authority)
                .unwrap();
            set.insert(
                handle,
                EntityReplicationData::new(NetEntityRole::SimulatedProxy, i as f32),
            );
            handle
        })
        .collect();
    let config = ReplicationConfig {
        max_messages_per_packet: 4096,
        ..ReplicationConfig::default()
    };
    let mut manager = EntityReplicationManager::new(
        UpdateMode::LocalServerToRemoteClient,
        "client",
        HASH,
        config,
    );
    manager.set_replication_window(Box::new(FullWindow { set }), &world, TimeMs::ZERO);
    let mut sink = Sink::default();
    manager
        .send_updates(&mut world, &mut sink, TimeMs::ZERO)
        .unwrap();
    (world, manager, handles, sink)
}

/// A server whose client has acknowledged every entity's creation.
fn established() -> (LocalWorld, EntityReplicationManager, Vec<NetEntityHandle>) {
    let (world, mut manager, handles, sink) = created();
    for (id, _) in sink.packets {
        manager.on_packet_acked(id);
    }
    (world, manager, handles)
}

fn bench_send_updates(c: &mut Criterion) {
    c.bench_function("send_updates/quarter_dirty", |b| {
        b.iter_batched(
            || {
                let (mut world, manager, handles) = established();
                for (i, handle) in handles.iter().enumerate().filter(|(i, _)| i % 4 == 0) {
                    world
                        .entity_mut(*handle)
                        .unwrap()
                        .set_property(pid(1), PropertyValue::SInt(i as i64 * 7 + 1))
                        .unwrap();
                }
                (world, manager)
            },
            |(mut world, mut manager)| {
                let mut sink = Sink::default();
                let stats = manager
                    .send_updates(&mut world, &mut sink, TimeMs::new(16))
                    .unwrap();
                black_box(stats)
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_handle_packet(c: &mut Criterion) {
    let (_, _, _, creation) = created();

    c.bench_function("handle_packet/creation", |b| {
        b.iter_batched(
            || {
                (
                    world(),
                    EntityReplicationManager::new(
                        UpdateMode::LocalClientToRemoteServer,
                        "server",
                        HASH,
                        ReplicationConfig::default(),
                    ),
                )
            },
            |(mut world, mut client)| {
                for (id, bytes) in &creation.packets {
                    client
                        .handle_packet(*id, bytes, &mut world, TimeMs::ZERO)
                        .unwrap();
                }
                black_box(client.entities_pending_activation())
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_send_updates, bench_handle_packet);
criterion_main!(benches);
