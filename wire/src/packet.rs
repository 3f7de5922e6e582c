//! Packet encoding and decoding.

use bitstream::{BitReader, BitWriter};

use crate::error::{DecodeError, EncodeError, LimitKind, WireResult};
use crate::header::{PacketHeader, PacketKind, HEADER_SIZE, MAGIC, VERSION};
use crate::limits::Limits;
use crate::message::{varint_len, EntityUpdateMessage};

/// Decoded payload of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketBody<'a> {
    EntityUpdates(Vec<EntityUpdateMessage<'a>>),
    EntityResets(Vec<u64>),
}

/// A decoded wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket<'a> {
    pub header: PacketHeader,
    pub body: PacketBody<'a>,
}

/// Decodes a wire packet into its header and messages.
///
/// Every length and count is checked against `limits` before use; the
/// returned messages borrow their property data from `buf`.
pub fn decode_packet<'a>(buf: &'a [u8], limits: &Limits) -> WireResult<WirePacket<'a>> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::PacketTooSmall {
            actual: buf.len(),
            required: HEADER_SIZE,
        });
    }
    if buf.len() > limits.max_packet_bytes {
        return Err(DecodeError::LimitsExceeded {
            kind: LimitKind::PacketBytes,
            limit: limits.max_packet_bytes,
            actual: buf.len(),
        });
    }

    let header = decode_header(&buf[..HEADER_SIZE])?;

    let actual_payload_len = buf.len() - HEADER_SIZE;
    if header.payload_len as usize != actual_payload_len {
        return Err(DecodeError::PayloadLengthMismatch {
            header_len: header.payload_len,
            actual_len: actual_payload_len,
        });
    }

    let count = usize::from(header.message_count);
    if count > limits.max_messages {
        return Err(DecodeError::LimitsExceeded {
            kind: LimitKind::MessageCount,
            limit: limits.max_messages,
            actual: count,
        });
    }

    let mut reader = BitReader::new(&buf[HEADER_SIZE..]);
    let body = match header.kind {
        PacketKind::EntityUpdate => {
            let mut messages = Vec::with_capacity(count);
            for _ in 0..count {
                messages.push(EntityUpdateMessage::read(&mut reader, limits)?);
            }
            PacketBody::EntityUpdates(messages)
        }
        PacketKind::EntityReset => {
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(reader.read_varu64()?);
            }
            PacketBody::EntityResets(ids)
        }
    };

    if !reader.is_empty() {
        return Err(DecodeError::TrailingPayload {
            remaining: reader.bits_remaining() / 8,
        });
    }

    Ok(WirePacket { header, body })
}

fn decode_header(buf: &[u8]) -> WireResult<PacketHeader> {
    let mut reader = BitReader::new(buf);
    let magic = reader.read_u32_aligned()?;
    if magic != MAGIC {
        return Err(DecodeError::InvalidMagic { found: magic });
    }

    let version = reader.read_u16_aligned()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion { found: version });
    }

    let kind_raw = reader.read_u16_aligned()?;
    let kind =
        PacketKind::from_raw(kind_raw).ok_or(DecodeError::UnknownPacketKind { kind: kind_raw })?;

    Ok(PacketHeader {
        version,
        kind,
        schema_hash: reader.read_u64_aligned()?,
        message_count: reader.read_u16_aligned()?,
        payload_len: reader.read_u32_aligned()?,
    })
}

/// Encodes a packet header into the provided output buffer.
pub fn encode_header(header: &PacketHeader, out: &mut [u8]) -> Result<usize, EncodeError> {
    if out.len() < HEADER_SIZE {
        return Err(EncodeError::BufferTooSmall {
            needed: HEADER_SIZE,
            available: out.len(),
        });
    }

    out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    out[4..6].copy_from_slice(&header.version.to_le_bytes());
    out[6..8].copy_from_slice(&header.kind.raw().to_le_bytes());
    out[8..16].copy_from_slice(&header.schema_hash.to_le_bytes());
    out[16..18].copy_from_slice(&header.message_count.to_le_bytes());
    out[18..22].copy_from_slice(&header.payload_len.to_le_bytes());

    Ok(HEADER_SIZE)
}

/// Size of an update packet carrying `messages`.
#[must_use]
pub fn update_packet_size(messages: &[EntityUpdateMessage<'_>]) -> usize {
    HEADER_SIZE
        + messages
            .iter()
            .map(EntityUpdateMessage::estimated_size)
            .sum::<usize>()
}

/// Encodes an entity update packet, returning the number of bytes written.
pub fn encode_update_packet(
    schema_hash: u64,
    messages: &[EntityUpdateMessage<'_>],
    out: &mut [u8],
) -> Result<usize, EncodeError> {
    let count = u16::try_from(messages.len()).map_err(|_| EncodeError::TooManyMessages {
        count: messages.len(),
    })?;
    let needed = update_packet_size(messages);
    if out.len() < needed {
        return Err(EncodeError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    let mut writer = BitWriter::with_capacity(needed - HEADER_SIZE);
    for msg in messages {
        if u32::try_from(msg.data.len()).is_err() {
            return Err(EncodeError::LengthOverflow {
                length: msg.data.len(),
            });
        }
        msg.write(&mut writer)
            .map_err(|_| EncodeError::LengthOverflow {
                length: msg.data.len(),
            })?;
    }
    let payload = writer.finish();
    write_packet(
        PacketHeader::entity_update(schema_hash, count, payload_len(&payload)?),
        &payload,
        out,
    )
}

/// Encodes an entity reset packet naming `entity_ids`.
pub fn encode_reset_packet(
    schema_hash: u64,
    entity_ids: &[u64],
    out: &mut [u8],
) -> Result<usize, EncodeError> {
    let count = u16::try_from(entity_ids.len()).map_err(|_| EncodeError::TooManyMessages {
        count: entity_ids.len(),
    })?;
    let needed = HEADER_SIZE + entity_ids.iter().map(|id| varint_len(*id)).sum::<usize>();
    if out.len() < needed {
        return Err(EncodeError::BufferTooSmall {
            needed,
            available: out.len(),
        });
    }

    let mut writer = BitWriter::with_capacity(needed - HEADER_SIZE);
    for id in entity_ids {
        writer
            .write_varu64(*id)
            .map_err(|_| EncodeError::LengthOverflow { length: needed })?;
    }
    let payload = writer.finish();
    write_packet(
        PacketHeader::entity_reset(schema_hash, count, payload_len(&payload)?),
        &payload,
        out,
    )
}

fn payload_len(payload: &[u8]) -> Result<u32, EncodeError> {
    u32::try_from(payload.len()).map_err(|_| EncodeError::LengthOverflow {
        length: payload.len(),
    })
}

fn write_packet(header: PacketHeader, payload: &[u8], out: &mut [u8]) -> Result<usize, EncodeError> {
    let offset = encode_header(&header, out)?;
    let end = offset + payload.len();
    if out.len() < end {
        return Err(EncodeError::BufferTooSmall {
            needed: end,
            available: out.len(),
        });
    }
    out[offset..end].copy_from_slice(payload);
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PrefabEntityId;

    fn encode_updates(messages: &[EntityUpdateMessage<'_>]) -> Vec<u8> {
        let mut buf = vec![0u8; update_packet_size(messages)];
        let written = encode_update_packet(0xFEED, messages, &mut buf).unwrap();
        assert_eq!(written, buf.len());
        buf
    }

    #[test]
    fn empty_update_packet() {
        let buf = encode_updates(&[]);
        assert_eq!(buf.len(), HEADER_SIZE);
        let packet = decode_packet(&buf, &Limits::for_testing()).unwrap();
        assert_eq!(packet.header.kind, PacketKind::EntityUpdate);
        assert_eq!(packet.header.schema_hash, 0xFEED);
        assert_eq!(packet.body, PacketBody::EntityUpdates(Vec::new()));
    }

    #[test]
    fn update_packet_preserves_messages() {
        let data = [1u8, 2, 3, 4];
        let messages = [
            EntityUpdateMessage::update(5, 3, &data).with_prefab(PrefabEntityId::new(10, 1)),
            EntityUpdateMessage::update(6, 2, &data[..1]),
            EntityUpdateMessage::delete(7, 3, false),
        ];
        let buf = encode_updates(&messages);
        let packet = decode_packet(&buf, &Limits::for_testing()).unwrap();
        assert_eq!(packet.header.message_count, 3);
        assert_eq!(packet.body, PacketBody::EntityUpdates(messages.to_vec()));
    }

    #[test]
    fn reset_packet_preserves_ids() {
        let ids = [1u64, 1 << 40, 77];
        let mut buf = vec![0u8; 64];
        let len = encode_reset_packet(9, &ids, &mut buf).unwrap();
        let packet = decode_packet(&buf[..len], &Limits::for_testing()).unwrap();
        assert_eq!(packet.header.kind, PacketKind::EntityReset);
        assert_eq!(packet.body, PacketBody::EntityResets(ids.to_vec()));
    }

    #[test]
    fn encode_rejects_small_buffer() {
        let messages = [EntityUpdateMessage::update(5, 3, &[0; 16])];
        let mut buf = vec![0u8; HEADER_SIZE + 4];
        let err = encode_update_packet(0, &messages, &mut buf).unwrap_err();
        assert!(matches!(err, EncodeError::BufferTooSmall { .. }));
    }

    #[test]
    fn decode_rejects_invalid_magic() {
        let mut buf = encode_updates(&[]);
        buf[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        let err = decode_packet(&buf, &Limits::for_testing()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidMagic { .. }));
    }

    #[test]
    fn decode_rejects_unknown_version_and_kind() {
        let mut buf = encode_updates(&[]);
        buf[4..6].copy_from_slice(&9u16.to_le_bytes());
        assert_eq!(
            decode_packet(&buf, &Limits::for_testing()).unwrap_err(),
            DecodeError::UnsupportedVersion { found: 9 }
        );

        let mut buf = encode_updates(&[]);
        buf[6..8].copy_from_slice(&7u16.to_le_bytes());
        assert_eq!(
            decode_packet(&buf, &Limits::for_testing()).unwrap_err(),
            DecodeError::UnknownPacketKind { kind: 7 }
        );
    }

    #[test]
    fn decode_payload_length_mismatch() {
        let mut buf = encode_updates(&[EntityUpdateMessage::update(1, 3, &[9])]);
        buf.push(0);
        let err = decode_packet(&buf, &Limits::for_testing()).unwrap_err();
        assert!(matches!(err, DecodeError::PayloadLengthMismatch { .. }));
    }

    #[test]
    fn decode_rejects_overstated_message_count() {
        let mut buf = encode_updates(&[EntityUpdateMessage::update(1, 3, &[9])]);
        buf[16..18].copy_from_slice(&2u16.to_le_bytes());
        let err = decode_packet(&buf, &Limits::for_testing()).unwrap_err();
        assert!(matches!(err, DecodeError::Framing(_)));
    }

    #[test]
    fn decode_rejects_understated_message_count() {
        let mut buf = encode_updates(&[
            EntityUpdateMessage::update(1, 3, &[9]),
            EntityUpdateMessage::update(2, 3, &[9]),
        ]);
        buf[16..18].copy_from_slice(&1u16.to_le_bytes());
        let err = decode_packet(&buf, &Limits::for_testing()).unwrap_err();
        assert!(matches!(err, DecodeError::TrailingPayload { .. }));
    }

    #[test]
    fn decode_enforces_message_count_limit() {
        let messages: Vec<_> = (0..4)
            .map(|id| EntityUpdateMessage::update(id, 3, &[]))
            .collect();
        let buf = encode_updates(&messages);
        let limits = Limits {
            max_messages: 3,
            ..Limits::for_testing()
        };
        let err = decode_packet(&buf, &limits).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LimitsExceeded {
                kind: LimitKind::MessageCount,
                ..
            }
        ));
    }

    #[test]
    fn decode_enforces_packet_byte_limit() {
        let buf = encode_updates(&[EntityUpdateMessage::update(1, 3, &[0; 64])]);
        let limits = Limits {
            max_packet_bytes: HEADER_SIZE + 8,
            ..Limits::for_testing()
        };
        let err = decode_packet(&buf, &limits).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::LimitsExceeded {
                kind: LimitKind::PacketBytes,
                ..
            }
        ));
    }

    #[test]
    fn decode_rejects_too_small() {
        let err = decode_packet(&[0u8; 4], &Limits::for_testing()).unwrap_err();
        assert!(matches!(err, DecodeError::PacketTooSmall { .. }));
    }
}
