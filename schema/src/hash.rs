//! Deterministic schema hashing.

use blake3::Hasher;

use crate::{ChangePolicy, FixedPoint, PropertyCodec, Schema};

/// Computes a deterministic hash for schema validation.
///
/// Both ends of a connection must compute the same value; packets carrying a
/// different hash are rejected.
#[must_use]
pub fn schema_hash(schema: &Schema) -> u64 {
    let mut hasher = Hasher::new();
    write_len(&mut hasher, schema.components.len());

    for component in &schema.components {
        write_u16(&mut hasher, component.id.get());
        write_len(&mut hasher, component.properties.len());

        for property in &component.properties {
            write_u16(&mut hasher, property.id.get());
            write_codec(&mut hasher, property.codec);
            write_change_policy(&mut hasher, property.change);
        }
    }

    let hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(prefix)
}

fn write_codec(hasher: &mut Hasher, codec: PropertyCodec) {
    match codec {
        PropertyCodec::Bool => write_u8(hasher, 0),
        PropertyCodec::UInt { bits } => {
            write_u8(hasher, 1);
            write_u8(hasher, bits);
        }
        PropertyCodec::SInt { bits } => {
            write_u8(hasher, 2);
            write_u8(hasher, bits);
        }
        PropertyCodec::VarUInt => write_u8(hasher, 3),
        PropertyCodec::VarSInt => write_u8(hasher, 4),
        PropertyCodec::FixedPoint(fp) => {
            write_u8(hasher, 5);
            write_fixed_point(hasher, fp);
        }
        PropertyCodec::F32 => write_u8(hasher, 6),
    }
}

fn write_change_policy(hasher: &mut Hasher, policy: ChangePolicy) {
    match policy {
        ChangePolicy::Always => write_u8(hasher, 0),
        ChangePolicy::Threshold { threshold_q } => {
            write_u8(hasher, 1);
            hasher.update(&threshold_q.to_le_bytes());
        }
    }
}

fn write_fixed_point(hasher: &mut Hasher, fp: FixedPoint) {
    hasher.update(&fp.min_q.to_le_bytes());
    hasher.update(&fp.max_q.to_le_bytes());
    hasher.update(&fp.scale.to_le_bytes());
}

fn write_len(hasher: &mut Hasher, len: usize) {
    hasher.update(&(len as u64).to_le_bytes());
}

fn write_u8(hasher: &mut Hasher, value: u8) {
    hasher.update(&[value]);
}

fn write_u16(hasher: &mut Hasher, value: u16) {
    hasher.update(&value.to_le_bytes());
}
