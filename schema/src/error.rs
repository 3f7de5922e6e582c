//! Schema validation errors.

use std::fmt;

use crate::{ComponentId, PropertyId};

/// Result type for schema operations.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Errors that can occur when building or validating a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// Duplicate component ID in a schema.
    DuplicateComponentId { id: ComponentId },

    /// Duplicate property ID within a component.
    DuplicatePropertyId {
        component: ComponentId,
        property: PropertyId,
    },

    /// More properties than a dirty mask can address.
    TooManyProperties {
        component: ComponentId,
        count: usize,
        max: usize,
    },

    /// Invalid bit width for fixed-width integers.
    InvalidBitWidth { bits: u8 },

    /// Fixed-point scale must be non-zero.
    InvalidFixedPointScale { scale: u32 },

    /// Fixed-point min/max range is invalid.
    InvalidFixedPointRange { min_q: i64, max_q: i64 },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateComponentId { id } => write!(f, "duplicate component id {id}"),
            Self::DuplicatePropertyId {
                component,
                property,
            } => write!(f, "duplicate property id {property} in component {component}"),
            Self::TooManyProperties {
                component,
                count,
                max,
            } => write!(
                f,
                "component {component} has {count} properties, maximum is {max}"
            ),
            Self::InvalidBitWidth { bits } => write!(f, "invalid bit width {bits}"),
            Self::InvalidFixedPointScale { scale } => {
                write!(f, "invalid fixed-point scale {scale}")
            }
            Self::InvalidFixedPointRange { min_q, max_q } => {
                write!(f, "invalid fixed-point range {min_q}..={max_q}")
            }
        }
    }
}

impl std::error::Error for SchemaError {}
