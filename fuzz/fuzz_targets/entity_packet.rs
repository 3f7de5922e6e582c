#![no_main]

use libfuzzer_sys::fuzz_target;
use replication::{
    EntityReplicationManager, LocalWorld, ReplicationConfig, TimeMs, UpdateMode,
};
use schema::{ComponentDef, ComponentId, PropertyCodec, PropertyDef, PropertyId};
use wire::PacketId;

const HASH: u64 = 0xF022;

fn world() -> LocalWorld {
    let mut world = LocalWorld::new();
    world.register_prefab(
        1,
        ComponentDef::new(ComponentId::new(1).unwrap())
            .property(PropertyDef::new(PropertyId::new(1).unwrap(), PropertyCodec::bool()))
            .property(PropertyDef::new(PropertyId::new(2).unwrap(), PropertyCodec::var_sint()))
            .property(PropertyDef::new(
                PropertyId::new(3).unwrap(),
                PropertyCodec::fixed_point(-1000, 1000, 10),
            )),
    );
    world
}

fuzz_target!(|data: &[u8]| {
    let _ = wire::decode_packet(data, &wire::Limits::for_testing());

    // Split the input into frames and feed them to both sides of a
    // connection. Errors are fine; panics are not.
    let mut client_world = world();
    let mut client = EntityReplicationManager::new(
        UpdateMode::LocalClientToRemoteServer,
        "server",
        HASH,
        ReplicationConfig::for_testing(),
    )
    .with_limits(wire::Limits::for_testing());
    let mut server_world = world();
    let mut server = EntityReplicationManager::new(
        UpdateMode::LocalServerToRemoteClient,
        "client",
        HASH,
        ReplicationConfig::for_testing(),
    )
    .with_limits(wire::Limits::for_testing());

    let mut idx = 0usize;
    let mut packet = 0u32;
    while idx < data.len() && idx < 4096 {
        let len = (data[idx] as usize % 200).saturating_add(1);
        idx += 1;
        let end = (idx + len).min(data.len());
        let frame = &data[idx..end];
        idx = end;
        packet += 1;

        let now = TimeMs::new(u64::from(packet) * 16);
        let id = PacketId::new(packet);
        let _ = client.handle_packet(id, frame, &mut client_world, now);
        let _ = server.handle_packet(id, frame, &mut server_world, now);
        client.activate_pending_entities(&mut client_world);
        client.clear_removed_replicators(&mut client_world, now);
    }
});
