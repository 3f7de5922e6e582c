//! Packet header types and constants.

/// Magic number identifying netrep packets.
///
/// This value is fixed and must never change across versions.
pub const MAGIC: u32 = 0x4E52_4550; // "NREP" in ASCII

/// Current wire format version.
pub const VERSION: u16 = 1;

/// Header size in bytes (22 total).
pub const HEADER_SIZE: usize = 4 + 2 + 2 + 8 + 2 + 4;

/// What a packet's payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketKind {
    /// A batch of entity update messages.
    EntityUpdate = 1,
    /// A list of entity ids whose full state the sender asks to be resent.
    EntityReset = 2,
}

impl PacketKind {
    /// Parses a packet kind from its raw value.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            1 => Some(Self::EntityUpdate),
            2 => Some(Self::EntityReset),
            _ => None,
        }
    }

    #[must_use]
    pub const fn raw(self) -> u16 {
        self as u16
    }
}

/// Packet header.
///
/// This struct represents the header fields *after* the magic number.
/// The magic number is validated separately during decoding and is not
/// stored in this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Wire format version.
    pub version: u16,
    /// Payload kind.
    pub kind: PacketKind,
    /// Schema hash for compatibility checking.
    pub schema_hash: u64,
    /// Number of messages (or reset ids) in the payload.
    pub message_count: u16,
    /// Payload length in bytes.
    pub payload_len: u32,
}

impl PacketHeader {
    /// Creates a header for an entity update packet.
    #[must_use]
    pub const fn entity_update(schema_hash: u64, message_count: u16, payload_len: u32) -> Self {
        Self {
            version: VERSION,
            kind: PacketKind::EntityUpdate,
            schema_hash,
            message_count,
            payload_len,
        }
    }

    /// Creates a header for an entity reset packet.
    #[must_use]
    pub const fn entity_reset(schema_hash: u64, message_count: u16, payload_len: u32) -> Self {
        Self {
            version: VERSION,
            kind: PacketKind::EntityReset,
            schema_hash,
            message_count,
            payload_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_is_nrep_ascii() {
        assert_eq!(&MAGIC.to_be_bytes(), b"NREP");
    }

    #[test]
    fn header_size_is_correct() {
        // magic(4) + version(2) + kind(2) + schema_hash(8) + message_count(2) + payload_len(4)
        assert_eq!(HEADER_SIZE, 22);
    }

    #[test]
    fn kind_raw_roundtrip() {
        for kind in [PacketKind::EntityUpdate, PacketKind::EntityReset] {
            assert_eq!(PacketKind::from_raw(kind.raw()), Some(kind));
        }
        assert_eq!(PacketKind::from_raw(0), None);
        assert_eq!(PacketKind::from_raw(3), None);
    }

    #[test]
    fn header_constructors() {
        let update = PacketHeader::entity_update(0xABCD, 3, 120);
        assert_eq!(update.version, VERSION);
        assert_eq!(update.kind, PacketKind::EntityUpdate);
        assert_eq!(update.message_count, 3);
        assert_eq!(update.payload_len, 120);

        let reset = PacketHeader::entity_reset(0xABCD, 1, 2);
        assert_eq!(reset.kind, PacketKind::EntityReset);
        assert_ne!(update, reset);
    }

    #[test]
    fn header_const_constructible() {
        const HEADER: PacketHeader = PacketHeader::entity_update(0, 0, 0);
        assert_eq!(HEADER.message_count, 0);
    }
}
