//! Replicated property schema and schema hashing for netrep.
//!
//! This crate defines how replicated entity state is described:
//! - Components made of ordered properties
//! - Property codecs (bool, integers, fixed-point, varints, floats)
//! - Change thresholds
//! - Deterministic schema hashing
//!
//! # Design Principles
//!
//! - **Runtime-first** - Schemas are built at runtime, no derive macros.
//! - **Explicit schemas** - No reflection on arbitrary Rust types.
//! - **Deterministic hashing** - Schema hash is stable given the same definition.

use std::num::NonZeroU16;

mod error;
mod hash;
mod property;
mod schema;

pub use error::{SchemaError, SchemaResult};
pub use hash::schema_hash;
pub use property::{ChangePolicy, FixedPoint, PropertyCodec, PropertyDef};
pub use schema::{ComponentDef, Schema, SchemaBuilder, MAX_PROPERTIES_PER_COMPONENT};

/// A component ID within a schema.
pub type ComponentId = NonZeroU16;

/// A property ID within a component.
pub type PropertyId = NonZeroU16;
