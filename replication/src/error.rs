//! Error types for replication.

use std::fmt;

use bitstream::SerializeError;
use wire::{DecodeError, EncodeError, PacketId, PrefabEntityId};

use crate::types::NetEntityHandle;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Failure while moving property values through a serializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyError {
    /// The serializer ran out of data or rejected a value.
    Serialize(SerializeError),

    /// The dirty mask names a property the component does not have.
    UnknownProperty { bit: u32, count: usize },

    /// A value is outside the property's declared range.
    ValueOutOfRange { property: u16, value: i64 },

    /// A value's kind does not match the property codec.
    TypeMismatch { property: u16, expected: &'static str },

    /// The component has no property with this id.
    NoSuchProperty { property: u16 },

    /// Data was left over after the masked properties were read.
    TrailingData { bits: usize },
}

/// Errors surfaced by the replication layer.
///
/// Every variant returned from inbound processing is fatal for the
/// connection: the stream can no longer be interpreted safely.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ReplicationError {
    /// A packet failed wire-level decoding.
    Decode(DecodeError),

    /// An outbound packet could not be encoded.
    Encode(EncodeError),

    /// The remote uses a different property schema.
    SchemaMismatch { expected: u64, found: u64 },

    /// A message carried a role value this host does not know.
    InvalidRole { entity: NetEntityHandle, raw: u8 },

    /// Property data failed to deserialize after its packet id was accepted.
    PropertyDeserialize {
        entity: NetEntityHandle,
        packet_id: PacketId,
        source: PropertyError,
    },

    /// Local property state could not be serialized.
    PropertySerialize {
        entity: NetEntityHandle,
        source: PropertyError,
    },

    /// The remote sent an update this connection mode does not permit.
    UnexpectedUpdate {
        entity: NetEntityHandle,
        reason: &'static str,
    },

    /// The world could not create an entity from a prefab.
    EntityCreateFailed {
        entity: NetEntityHandle,
        prefab: PrefabEntityId,
    },
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(err) => write!(f, "{err}"),
            Self::UnknownProperty { bit, count } => {
                write!(f, "dirty bit {bit} out of range for {count} properties")
            }
            Self::ValueOutOfRange { property, value } => {
                write!(f, "property {property} value {value} out of range")
            }
            Self::TypeMismatch { property, expected } => {
                write!(f, "property {property} expects a {expected} value")
            }
            Self::NoSuchProperty { property } => write!(f, "no property {property}"),
            Self::TrailingData { bits } => {
                write!(f, "{bits} bits left over after the masked properties")
            }
        }
    }
}

impl std::error::Error for PropertyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Serialize(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SerializeError> for PropertyError {
    fn from(err: SerializeError) -> Self {
        Self::Serialize(err)
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "packet decode failed: {err}"),
            Self::Encode(err) => write!(f, "packet encode failed: {err}"),
            Self::SchemaMismatch { expected, found } => write!(
                f,
                "schema hash mismatch: expected 0x{expected:016X}, found 0x{found:016X}"
            ),
            Self::InvalidRole { entity, raw } => {
                write!(f, "entity {entity}: invalid role value {raw}")
            }
            Self::PropertyDeserialize {
                entity,
                packet_id,
                source,
            } => write!(
                f,
                "entity {entity}: property deserialization failed in packet {packet_id}: {source}"
            ),
            Self::PropertySerialize { entity, source } => {
                write!(f, "entity {entity}: property serialization failed: {source}")
            }
            Self::UnexpectedUpdate { entity, reason } => {
                write!(f, "entity {entity}: unexpected update ({reason})")
            }
            Self::EntityCreateFailed { entity, prefab } => write!(
                f,
                "entity {entity}: failed to create from prefab {}:{}",
                prefab.prefab_id, prefab.entity_offset
            ),
        }
    }
}

impl std::error::Error for ReplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            Self::Encode(err) => Some(err),
            Self::PropertyDeserialize { source, .. } | Self::PropertySerialize { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}

impl From<DecodeError> for ReplicationError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

impl From<EncodeError> for ReplicationError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err)
    }
}
