//! Property codec and change policy definitions.

use crate::PropertyId;

/// Fixed-point quantization parameters (all integer-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FixedPoint {
    /// Minimum quantized value.
    pub min_q: i64,
    /// Maximum quantized value.
    pub max_q: i64,
    /// Units per 1.0 (e.g., 100 => 0.01 resolution).
    pub scale: u32,
}

impl FixedPoint {
    /// Creates a fixed-point configuration from quantized bounds and scale.
    #[must_use]
    pub const fn new(min_q: i64, max_q: i64, scale: u32) -> Self {
        Self {
            min_q,
            max_q,
            scale,
        }
    }

    /// Number of bits needed to encode `value - min_q`.
    #[must_use]
    pub const fn bits(&self) -> u8 {
        let span = self.max_q.abs_diff(self.min_q);
        if span == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        let bits = (u64::BITS - span.leading_zeros()) as u8;
        bits
    }

    /// Quantizes a real value, clamping to the representable range.
    #[must_use]
    pub fn quantize(&self, value: f64) -> i64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        let q = (value * f64::from(self.scale)).round() as i64;
        q.clamp(self.min_q, self.max_q)
    }

    /// Converts a quantized value back to a real value.
    #[must_use]
    pub fn dequantize(&self, value_q: i64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let value = value_q as f64;
        value / f64::from(self.scale)
    }
}

/// The encoding for a property (representation only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PropertyCodec {
    /// Boolean (1 bit).
    Bool,

    /// Unsigned integer with fixed bit width.
    UInt { bits: u8 },

    /// Signed integer with fixed bit width.
    SInt { bits: u8 },

    /// Variable-length unsigned integer.
    VarUInt,

    /// Variable-length signed integer (zigzag encoded).
    VarSInt,

    /// Fixed-point number with quantization.
    FixedPoint(FixedPoint),

    /// Raw IEEE-754 single precision float.
    F32,
}

impl PropertyCodec {
    #[must_use]
    pub const fn bool() -> Self {
        Self::Bool
    }

    #[must_use]
    pub const fn uint(bits: u8) -> Self {
        Self::UInt { bits }
    }

    #[must_use]
    pub const fn sint(bits: u8) -> Self {
        Self::SInt { bits }
    }

    #[must_use]
    pub const fn var_uint() -> Self {
        Self::VarUInt
    }

    #[must_use]
    pub const fn var_sint() -> Self {
        Self::VarSInt
    }

    #[must_use]
    pub const fn fixed_point(min_q: i64, max_q: i64, scale: u32) -> Self {
        Self::FixedPoint(FixedPoint::new(min_q, max_q, scale))
    }

    #[must_use]
    pub const fn f32() -> Self {
        Self::F32
    }
}

/// Change detection policy for a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChangePolicy {
    /// Every write that changes the value marks the property dirty.
    Always,
    /// Mark dirty only if the quantized difference from the last
    /// replicated value reaches this threshold.
    Threshold { threshold_q: u32 },
}

/// Property definition within a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PropertyDef {
    pub id: PropertyId,
    pub codec: PropertyCodec,
    pub change: ChangePolicy,
}

impl PropertyDef {
    /// Creates a property definition with the default change policy.
    #[must_use]
    pub const fn new(id: PropertyId, codec: PropertyCodec) -> Self {
        Self {
            id,
            codec,
            change: ChangePolicy::Always,
        }
    }

    /// Creates a property definition with a threshold policy.
    #[must_use]
    pub const fn with_threshold(id: PropertyId, codec: PropertyCodec, threshold_q: u32) -> Self {
        Self {
            id,
            codec,
            change: ChangePolicy::Threshold { threshold_q },
        }
    }

    /// Sets the change policy.
    #[must_use]
    pub const fn change(mut self, change: ChangePolicy) -> Self {
        self.change = change;
        self
    }
}
