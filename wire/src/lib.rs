//! Packet ids and entity update framing for netrep.
//!
//! This crate handles the binary wire format of the replication layer:
//! packet headers, entity update messages, reset requests, and limit
//! enforcement. It does not interpret property payloads or roles beyond
//! their raw bytes.
//!
//! # Design Principles
//!
//! - **Stable wire format** - The format is versioned and the header carries a schema hash.
//! - **Bounded decoding** - All length fields are validated against limits before iteration.
//! - **Transport owns ids** - [`PacketId`]s are assigned by the transport, not written here.

mod error;
mod header;
mod limits;
mod message;
mod packet;
mod packet_id;

pub use error::{DecodeError, EncodeError, LimitKind, WireResult};
pub use header::{PacketHeader, PacketKind, HEADER_SIZE, MAGIC, VERSION};
pub use limits::Limits;
pub use message::{EntityUpdateMessage, MessageFlags, PrefabEntityId};
pub use packet::{
    decode_packet, encode_header, encode_reset_packet, encode_update_packet,
    update_packet_size, PacketBody, WirePacket,
};
pub use packet_id::PacketId;
