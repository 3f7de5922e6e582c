use replication::PacketSender;
use wire::PacketId;

use crate::config::LinkConfig;

/// Deterministic LCG so a seed replays the same run.
#[derive(Debug, Clone)]
pub struct Rng {
    state: u64,
}

impl Rng {
    pub const fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        (self.state >> 32) as u32
    }

    pub fn range_i64(&mut self, min: i64, max: i64) -> i64 {
        let span = (max - min).unsigned_abs().max(1) + 1;
        let value = (self.next_u32() as u64) % span;
        min + value as i64
    }

    pub fn chance(&mut self, percent: u32) -> bool {
        self.next_u32() % 100 < percent
    }
}

#[derive(Debug, Clone)]
pub struct Datagram {
    pub id: PacketId,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub sent: u64,
    pub bytes: u64,
    pub lost: u64,
    pub duplicated: u64,
}

#[derive(Debug)]
struct InFlight {
    deliver_at: u64,
    datagram: Datagram,
}

/// One direction of an in-memory connection.
///
/// The owning manager sends through [`PacketSender`]; [`Link::pump`] then
/// decides the fate of each packet. Lost ids are reported back so the
/// sender can call `on_packet_lost`, and delivered ids are acknowledged by
/// the driver once the receiver has handled them.
#[derive(Debug)]
pub struct Link {
    config: LinkConfig,
    rng: Rng,
    next_id: u32,
    outbox: Vec<Datagram>,
    in_flight: Vec<InFlight>,
    stats: LinkStats,
    packet_sizes: Vec<u64>,
}

impl Link {
    pub fn new(config: LinkConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Rng::new(seed),
            next_id: 0,
            outbox: Vec::new(),
            in_flight: Vec::new(),
            stats: LinkStats::default(),
            packet_sizes: Vec::new(),
        }
    }

    pub fn set_config(&mut self, config: LinkConfig) {
        self.config = config;
    }

    /// Moves sent packets onto the wire. Returns the ids that were dropped.
    pub fn pump(&mut self, tick: u64) -> Vec<PacketId> {
        let mut lost = Vec::new();
        for datagram in std::mem::take(&mut self.outbox) {
            if self.rng.chance(self.config.loss_percent) {
                log::trace!("link dropped packet {}", datagram.id);
                self.stats.lost += 1;
                lost.push(datagram.id);
                continue;
            }
            let delay = if self.config.max_delay_ticks == 0 {
                0
            } else {
                u64::from(self.rng.next_u32() % (self.config.max_delay_ticks + 1))
            };
            if self.rng.chance(self.config.duplicate_percent) {
                self.stats.duplicated += 1;
                self.in_flight.push(InFlight {
                    deliver_at: tick + delay + 1,
                    datagram: datagram.clone(),
                });
            }
            self.in_flight.push(InFlight {
                deliver_at: tick + delay,
                datagram,
            });
        }
        lost
    }

    /// Packets arriving by `tick`, in send order among equal arrival ticks.
    pub fn deliver(&mut self, tick: u64) -> Vec<Datagram> {
        let (mut due, rest): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|packet| packet.deliver_at <= tick);
        self.in_flight = rest;
        due.sort_by_key(|packet| packet.deliver_at);
        due.into_iter().map(|packet| packet.datagram).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.outbox.is_empty() && self.in_flight.is_empty()
    }

    pub const fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn packet_sizes(&self) -> &[u64] {
        &self.packet_sizes
    }
}

impl PacketSender for Link {
    fn send_packet(&mut self, bytes: &[u8]) -> PacketId {
        self.next_id = self.next_id.wrapping_add(1);
        let id = PacketId::new(self.next_id);
        self.stats.sent += 1;
        self.stats.bytes += bytes.len() as u64;
        self.packet_sizes.push(bytes.len() as u64);
        self.outbox.push(Datagram {
            id,
            bytes: bytes.to_vec(),
        });
        id
    }
}
