//! Schema definitions and validation.

use std::collections::HashSet;

use crate::error::{SchemaError, SchemaResult};
use crate::{ComponentId, FixedPoint, PropertyCodec, PropertyDef, PropertyId};

/// Maximum properties per component; dirty sets are 64-bit masks.
pub const MAX_PROPERTIES_PER_COMPONENT: usize = 64;

/// A replicated component: an ordered list of properties.
///
/// A property's position in `properties` is its bit in a dirty mask.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComponentDef {
    pub id: ComponentId,
    pub properties: Vec<PropertyDef>,
}

impl ComponentDef {
    /// Creates a new component with no properties.
    #[must_use]
    pub fn new(id: ComponentId) -> Self {
        Self {
            id,
            properties: Vec::new(),
        }
    }

    /// Creates a component with the provided properties.
    #[must_use]
    pub fn with_properties(id: ComponentId, properties: Vec<PropertyDef>) -> Self {
        Self { id, properties }
    }

    /// Adds a property to the component.
    #[must_use]
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Position of a property, which is also its dirty-mask bit.
    #[must_use]
    pub fn property_index(&self, id: PropertyId) -> Option<usize> {
        self.properties.iter().position(|p| p.id == id)
    }

    fn validate(&self) -> SchemaResult<()> {
        if self.properties.len() > MAX_PROPERTIES_PER_COMPONENT {
            return Err(SchemaError::TooManyProperties {
                component: self.id,
                count: self.properties.len(),
                max: MAX_PROPERTIES_PER_COMPONENT,
            });
        }
        let mut property_ids = HashSet::new();
        for property in &self.properties {
            if !property_ids.insert(property.id) {
                return Err(SchemaError::DuplicatePropertyId {
                    component: self.id,
                    property: property.id,
                });
            }
            validate_property(property)?;
        }
        Ok(())
    }
}

/// A schema consisting of ordered components.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Schema {
    pub components: Vec<ComponentDef>,
}

impl Schema {
    /// Creates a schema from components after validation.
    pub fn new(components: Vec<ComponentDef>) -> SchemaResult<Self> {
        let schema = Self { components };
        schema.validate()?;
        Ok(schema)
    }

    /// Creates a schema builder.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Looks up a component by id.
    #[must_use]
    pub fn component(&self, id: ComponentId) -> Option<&ComponentDef> {
        self.components.iter().find(|c| c.id == id)
    }

    /// Validates schema invariants.
    pub fn validate(&self) -> SchemaResult<()> {
        let mut component_ids = HashSet::new();
        for component in &self.components {
            if !component_ids.insert(component.id) {
                return Err(SchemaError::DuplicateComponentId { id: component.id });
            }
            component.validate()?;
        }
        Ok(())
    }
}

/// Builder for `Schema`.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    components: Vec<ComponentDef>,
}

impl SchemaBuilder {
    /// Adds a component definition.
    #[must_use]
    pub fn component(mut self, component: ComponentDef) -> Self {
        self.components.push(component);
        self
    }

    /// Builds the schema after validation.
    pub fn build(self) -> SchemaResult<Schema> {
        Schema::new(self.components)
    }
}

fn validate_property(property: &PropertyDef) -> SchemaResult<()> {
    match property.codec {
        PropertyCodec::UInt { bits } | PropertyCodec::SInt { bits } => {
            if bits == 0 || bits > 64 {
                return Err(SchemaError::InvalidBitWidth { bits });
            }
        }
        PropertyCodec::FixedPoint(fp) => validate_fixed_point(fp)?,
        PropertyCodec::Bool
        | PropertyCodec::VarUInt
        | PropertyCodec::VarSInt
        | PropertyCodec::F32 => {}
    }
    Ok(())
}

fn validate_fixed_point(fp: FixedPoint) -> SchemaResult<()> {
    if fp.scale == 0 {
        return Err(SchemaError::InvalidFixedPointScale { scale: fp.scale });
    }
    if fp.min_q > fp.max_q {
        return Err(SchemaError::InvalidFixedPointRange {
            min_q: fp.min_q,
            max_q: fp.max_q,
        });
    }
    Ok(())
}
