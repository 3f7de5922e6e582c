//! Entity update messages.

use bitstream::{BitReader, BitWriter};

use crate::error::{DecodeError, LimitKind, WireResult};
use crate::limits::Limits;

/// Identifies the prefab (spawnable template) an entity is instantiated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PrefabEntityId {
    /// Stable id of the prefab asset.
    pub prefab_id: u32,
    /// Index of the entity inside the prefab.
    pub entity_offset: u32,
}

impl PrefabEntityId {
    #[must_use]
    pub const fn new(prefab_id: u32, entity_offset: u32) -> Self {
        Self {
            prefab_id,
            entity_offset,
        }
    }
}

/// Per-message flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const IS_DELETE: u8 = 1 << 0;
    pub const WAS_MIGRATED: u8 = 1 << 1;
    pub const HAS_PREFAB: u8 = 1 << 2;

    const RESERVED_MASK: u8 = !0b111;

    #[must_use]
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 & Self::RESERVED_MASK == 0
    }

    #[must_use]
    pub const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// One entity's worth of replication traffic.
///
/// `network_role` is the role the *receiver* should hold for the entity,
/// encoded with the replication layer's raw role values. `data` is the
/// opaque property payload (empty for deletes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityUpdateMessage<'a> {
    pub entity_id: u64,
    pub network_role: u8,
    pub is_delete: bool,
    pub was_migrated: bool,
    pub prefab: Option<PrefabEntityId>,
    pub data: &'a [u8],
}

impl<'a> EntityUpdateMessage<'a> {
    /// Creates a property update message.
    #[must_use]
    pub const fn update(entity_id: u64, network_role: u8, data: &'a [u8]) -> Self {
        Self {
            entity_id,
            network_role,
            is_delete: false,
            was_migrated: false,
            prefab: None,
            data,
        }
    }

    /// Creates a delete message.
    #[must_use]
    pub const fn delete(entity_id: u64, network_role: u8, was_migrated: bool) -> Self {
        Self {
            entity_id,
            network_role,
            is_delete: true,
            was_migrated,
            prefab: None,
            data: &[],
        }
    }

    /// Attaches the prefab id the receiver needs to create the entity.
    #[must_use]
    pub const fn with_prefab(mut self, prefab: PrefabEntityId) -> Self {
        self.prefab = Some(prefab);
        self
    }

    #[must_use]
    pub const fn flags(&self) -> MessageFlags {
        let mut raw = 0;
        if self.is_delete {
            raw |= MessageFlags::IS_DELETE;
        }
        if self.was_migrated {
            raw |= MessageFlags::WAS_MIGRATED;
        }
        if self.prefab.is_some() {
            raw |= MessageFlags::HAS_PREFAB;
        }
        MessageFlags(raw)
    }

    /// Exact number of bytes this message occupies on the wire.
    #[must_use]
    pub fn estimated_size(&self) -> usize {
        let prefab = if self.prefab.is_some() { 8 } else { 0 };
        1 + varint_len(self.entity_id)
            + 1
            + prefab
            + varint_len(self.data.len() as u64)
            + self.data.len()
    }

    pub(crate) fn write(&self, writer: &mut BitWriter) -> Result<(), bitstream::BitError> {
        writer.write_u8_aligned(self.flags().raw())?;
        writer.write_varu64(self.entity_id)?;
        writer.write_u8_aligned(self.network_role)?;
        if let Some(prefab) = self.prefab {
            writer.write_u32_aligned(prefab.prefab_id)?;
            writer.write_u32_aligned(prefab.entity_offset)?;
        }
        writer.write_varu64(self.data.len() as u64)?;
        writer.write_aligned_bytes(self.data)
    }

    pub(crate) fn read(reader: &mut BitReader<'a>, limits: &Limits) -> WireResult<Self> {
        let flags = MessageFlags::from_raw(reader.read_u8_aligned()?);
        if !flags.is_valid() {
            return Err(DecodeError::InvalidMessageFlags { flags: flags.raw() });
        }
        let entity_id = reader.read_varu64()?;
        let network_role = reader.read_u8_aligned()?;
        let prefab = if flags.has(MessageFlags::HAS_PREFAB) {
            let prefab_id = reader.read_u32_aligned()?;
            let entity_offset = reader.read_u32_aligned()?;
            Some(PrefabEntityId::new(prefab_id, entity_offset))
        } else {
            None
        };
        let data_len = reader.read_varu32()? as usize;
        if data_len > limits.max_message_data_len {
            return Err(DecodeError::LimitsExceeded {
                kind: LimitKind::MessageDataLength,
                limit: limits.max_message_data_len,
                actual: data_len,
            });
        }
        let data = reader.read_aligned_bytes(data_len)?;
        Ok(Self {
            entity_id,
            network_role,
            is_delete: flags.has(MessageFlags::IS_DELETE),
            was_migrated: flags.has(MessageFlags::WAS_MIGRATED),
            prefab,
            data,
        })
    }
}

pub(crate) const fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}
