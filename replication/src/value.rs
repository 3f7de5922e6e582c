//! Property values and their per-codec encoding.

use bitstream::{NetSerializer, SerializerMode};
use schema::{ChangePolicy, PropertyCodec, PropertyDef};

use crate::error::PropertyError;

/// A replicated property value.
///
/// Fixed-point properties are held in their quantized form.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyValue {
    Bool(bool),
    UInt(u64),
    SInt(i64),
    FixedPoint(i64),
    F32(f32),
}

impl PropertyValue {
    /// The zero value for a codec, clamped into its range.
    #[must_use]
    pub fn default_for(codec: PropertyCodec) -> Self {
        match codec {
            PropertyCodec::Bool => Self::Bool(false),
            PropertyCodec::UInt { .. } | PropertyCodec::VarUInt => Self::UInt(0),
            PropertyCodec::SInt { .. } | PropertyCodec::VarSInt => Self::SInt(0),
            PropertyCodec::FixedPoint(fp) => Self::FixedPoint(0i64.clamp(fp.min_q, fp.max_q)),
            PropertyCodec::F32 => Self::F32(0.0),
        }
    }

    /// Checks that this value can be encoded by `def`.
    pub fn validate(&self, def: &PropertyDef) -> Result<(), PropertyError> {
        let property = def.id.get();
        let out_of_range = |value: i64| PropertyError::ValueOutOfRange { property, value };
        match (def.codec, *self) {
            (PropertyCodec::Bool, Self::Bool(_)) | (PropertyCodec::F32, Self::F32(_)) => Ok(()),
            (PropertyCodec::UInt { bits }, Self::UInt(value)) => {
                if bits < 64 && value >= (1u64 << bits) {
                    Err(out_of_range(i64::try_from(value).unwrap_or(i64::MAX)))
                } else {
                    Ok(())
                }
            }
            (PropertyCodec::VarUInt, Self::UInt(value)) => {
                if u32::try_from(value).is_ok() {
                    Ok(())
                } else {
                    Err(out_of_range(i64::try_from(value).unwrap_or(i64::MAX)))
                }
            }
            (PropertyCodec::SInt { bits }, Self::SInt(value)) => {
                if sint_fits(value, bits) {
                    Ok(())
                } else {
                    Err(out_of_range(value))
                }
            }
            (PropertyCodec::VarSInt, Self::SInt(value)) => {
                if i32::try_from(value).is_ok() {
                    Ok(())
                } else {
                    Err(out_of_range(value))
                }
            }
            (PropertyCodec::FixedPoint(fp), Self::FixedPoint(value)) => {
                if (fp.min_q..=fp.max_q).contains(&value) {
                    Ok(())
                } else {
                    Err(out_of_range(value))
                }
            }
            (codec, _) => Err(PropertyError::TypeMismatch {
                property,
                expected: codec_name(codec),
            }),
        }
    }

    /// Whether moving from `previous` to `self` should mark the property dirty.
    #[must_use]
    pub fn exceeds_policy(&self, previous: &Self, policy: ChangePolicy) -> bool {
        if self == previous {
            return false;
        }
        let ChangePolicy::Threshold { threshold_q } = policy else {
            return true;
        };
        let threshold = u64::from(threshold_q);
        match (*self, *previous) {
            (Self::UInt(a), Self::UInt(b)) => a.abs_diff(b) >= threshold,
            (Self::SInt(a), Self::SInt(b)) | (Self::FixedPoint(a), Self::FixedPoint(b)) => {
                a.abs_diff(b) >= threshold
            }
            (Self::F32(a), Self::F32(b)) => f64::from((a - b).abs()) >= f64::from(threshold_q),
            _ => true,
        }
    }
}

/// Moves one property value through the serializer in either direction.
///
/// In read mode `value` is replaced by the decoded value, which is range
/// checked against `def`.
pub(crate) fn serialize_value(
    s: &mut dyn NetSerializer,
    def: &PropertyDef,
    value: &mut PropertyValue,
) -> Result<(), PropertyError> {
    if s.mode() == SerializerMode::WriteToBuffer {
        value.validate(def)?;
    }
    let property = def.id.get();
    match def.codec {
        PropertyCodec::Bool => {
            let mut raw = matches!(value, PropertyValue::Bool(true));
            s.serialize_bool(&mut raw, "bool")?;
            *value = PropertyValue::Bool(raw);
        }
        PropertyCodec::UInt { bits } => {
            let mut raw = match value {
                PropertyValue::UInt(v) => *v,
                _ => 0,
            };
            s.serialize_bits(&mut raw, bits, "uint")?;
            *value = PropertyValue::UInt(raw);
        }
        PropertyCodec::SInt { bits } => {
            let mut raw = match value {
                PropertyValue::SInt(v) => encode_sint(*v, bits),
                _ => 0,
            };
            s.serialize_bits(&mut raw, bits, "sint")?;
            *value = PropertyValue::SInt(decode_sint(raw, bits));
        }
        PropertyCodec::VarUInt => {
            s.align()?;
            let mut raw = match value {
                PropertyValue::UInt(v) => u32::try_from(*v).unwrap_or(u32::MAX),
                _ => 0,
            };
            s.serialize_varu32(&mut raw, "varuint")?;
            *value = PropertyValue::UInt(u64::from(raw));
        }
        PropertyCodec::VarSInt => {
            s.align()?;
            let mut raw = match value {
                PropertyValue::SInt(v) => i32::try_from(*v).unwrap_or(i32::MAX),
                _ => 0,
            };
            s.serialize_vars32(&mut raw, "varsint")?;
            *value = PropertyValue::SInt(i64::from(raw));
        }
        PropertyCodec::FixedPoint(fp) => {
            let mut raw = match value {
                PropertyValue::FixedPoint(v) => v.wrapping_sub(fp.min_q) as u64,
                _ => 0,
            };
            s.serialize_bits(&mut raw, fp.bits(), "fixed_point")?;
            #[allow(clippy::cast_possible_wrap)]
            let decoded = fp.min_q.wrapping_add(raw as i64);
            if decoded < fp.min_q || decoded > fp.max_q {
                return Err(PropertyError::ValueOutOfRange {
                    property,
                    value: decoded,
                });
            }
            *value = PropertyValue::FixedPoint(decoded);
        }
        PropertyCodec::F32 => {
            s.align()?;
            let mut raw = match value {
                PropertyValue::F32(v) => *v,
                _ => 0.0,
            };
            s.serialize_f32(&mut raw, "f32")?;
            *value = PropertyValue::F32(raw);
        }
    }
    Ok(())
}

const fn codec_name(codec: PropertyCodec) -> &'static str {
    match codec {
        PropertyCodec::Bool => "bool",
        PropertyCodec::UInt { .. } | PropertyCodec::VarUInt => "unsigned",
        PropertyCodec::SInt { .. } | PropertyCodec::VarSInt => "signed",
        PropertyCodec::FixedPoint(_) => "fixed-point",
        PropertyCodec::F32 => "f32",
    }
}

fn sint_fits(value: i64, bits: u8) -> bool {
    if bits >= 64 {
        return true;
    }
    if bits == 0 {
        return value == 0;
    }
    let min = -(1i128 << (bits - 1));
    let max = (1i128 << (bits - 1)) - 1;
    (min..=max).contains(&i128::from(value))
}

#[allow(clippy::cast_sign_loss)]
fn encode_sint(value: i64, bits: u8) -> u64 {
    if bits >= 64 {
        return value as u64;
    }
    (value as u64) & ((1u64 << bits) - 1)
}

#[allow(clippy::cast_possible_wrap)]
fn decode_sint(raw: u64, bits: u8) -> i64 {
    if bits == 0 {
        return 0;
    }
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - u32::from(bits);
    ((raw << shift) as i64) >> shift
}
