//! The component seam between replication and the host's entity model.

use std::fmt;

use bitstream::{NetSerializer, SerializerMode};
use schema::{ComponentDef, PropertyId};
use wire::PrefabEntityId;

use crate::error::PropertyError;
use crate::role::NetEntityRole;
use crate::value::{serialize_value, PropertyValue};

/// Set of property indices, one bit per property of a component.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DirtyMask(u64);

impl DirtyMask {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask with the first `count` bits set.
    #[must_use]
    pub const fn full(count: usize) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn set(&mut self, index: usize) {
        debug_assert!(index < 64, "property index {index} out of mask range");
        if index < 64 {
            self.0 |= 1u64 << index;
        }
    }

    #[must_use]
    pub const fn contains(self, index: usize) -> bool {
        index < 64 && self.0 & (1u64 << index) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Set indices, ascending.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..64usize).filter(move |index| self.contains(*index))
    }
}

impl fmt::Debug for DirtyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DirtyMask({:#b})", self.0)
    }
}

/// The replicated state of one networked entity, as seen by replication.
///
/// Implemented by whatever the host uses to store entity state. Replication
/// borrows a component only for the duration of one call, so it never holds
/// a reference past the entity's lifetime.
pub trait NetBindComponent {
    fn net_entity_role(&self) -> NetEntityRole;

    fn set_net_entity_role(&mut self, role: NetEntityRole);

    /// Prefab the entity was spawned from; sent with creation updates.
    fn prefab_entity_id(&self) -> PrefabEntityId;

    /// Mask with every property set.
    fn full_mask(&self) -> DirtyMask;

    /// Counter bumped whenever a property becomes dirty. A fresh entity
    /// starts above zero so everything reads as changed.
    fn change_sequence(&self) -> u64;

    /// Properties that became dirty after sequence `since`.
    ///
    /// Each observer keeps its own watermark, so any number of connections
    /// can watch the same entity.
    fn dirty_since(&self, since: u64) -> DirtyMask;

    /// Writes `mask` then the masked values, or reads them back into the
    /// component. In read mode `mask` is replaced by the decoded mask.
    fn serialize_properties(
        &mut self,
        serializer: &mut dyn NetSerializer,
        mask: &mut DirtyMask,
    ) -> Result<(), PropertyError>;

    /// Fires change notifications for the properties in `mask`.
    fn notify_property_changes(&mut self, mask: DirtyMask);
}

/// A change notification produced after remote values were applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyChange {
    pub property: PropertyId,
    pub value: PropertyValue,
}

/// Schema-driven [`NetBindComponent`].
///
/// Values are validated on write. Properties with a threshold policy only
/// become dirty once they drift far enough from the last value that was
/// marked for replication.
#[derive(Debug, Clone)]
pub struct ReplicatedEntity {
    def: ComponentDef,
    prefab: PrefabEntityId,
    role: NetEntityRole,
    values: Vec<PropertyValue>,
    baseline: Vec<PropertyValue>,
    sequence: u64,
    changed_at: Vec<u64>,
    changes: Vec<PropertyChange>,
}

impl ReplicatedEntity {
    /// Creates an entity with default values and every property dirty.
    #[must_use]
    pub fn new(def: ComponentDef, prefab: PrefabEntityId, role: NetEntityRole) -> Self {
        let values: Vec<_> = def
            .properties
            .iter()
            .map(|p| PropertyValue::default_for(p.codec))
            .collect();
        let changed_at = vec![1; values.len()];
        Self {
            def,
            prefab,
            role,
            baseline: values.clone(),
            values,
            sequence: 1,
            changed_at,
            changes: Vec::new(),
        }
    }

    #[must_use]
    pub const fn def(&self) -> &ComponentDef {
        &self.def
    }

    #[must_use]
    pub fn property(&self, id: PropertyId) -> Option<PropertyValue> {
        self.def.property_index(id).map(|index| self.values[index])
    }

    /// Current values in schema order.
    #[must_use]
    pub fn values(&self) -> &[PropertyValue] {
        &self.values
    }

    /// Stores a value. Returns `true` if it marked the property dirty.
    pub fn set_property(
        &mut self,
        id: PropertyId,
        value: PropertyValue,
    ) -> Result<bool, PropertyError> {
        let index = self
            .def
            .property_index(id)
            .ok_or(PropertyError::NoSuchProperty { property: id.get() })?;
        let def = &self.def.properties[index];
        value.validate(def)?;
        self.values[index] = value;
        if value.exceeds_policy(&self.baseline[index], def.change) {
            self.baseline[index] = value;
            self.mark_dirty(DirtyMask::from_raw(1 << index));
            return Ok(true);
        }
        Ok(false)
    }

    /// Marks every property dirty.
    pub fn mark_all_dirty(&mut self) {
        self.mark_dirty(self.full_mask());
    }

    fn mark_dirty(&mut self, mask: DirtyMask) {
        if mask.is_empty() {
            return;
        }
        self.sequence += 1;
        for index in mask.iter() {
            if let Some(changed) = self.changed_at.get_mut(index) {
                *changed = self.sequence;
            }
        }
    }

    /// Takes the change notifications queued by applied remote updates.
    pub fn drain_changes(&mut self) -> Vec<PropertyChange> {
        std::mem::take(&mut self.changes)
    }
}

impl NetBindComponent for ReplicatedEntity {
    fn net_entity_role(&self) -> NetEntityRole {
        self.role
    }

    fn set_net_entity_role(&mut self, role: NetEntityRole) {
        self.role = role;
    }

    fn prefab_entity_id(&self) -> PrefabEntityId {
        self.prefab
    }

    fn full_mask(&self) -> DirtyMask {
        DirtyMask::full(self.values.len())
    }

    fn change_sequence(&self) -> u64 {
        self.sequence
    }

    fn dirty_since(&self, since: u64) -> DirtyMask {
        let mut mask = DirtyMask::empty();
        for (index, changed) in self.changed_at.iter().enumerate() {
            if *changed > since {
                mask.set(index);
            }
        }
        mask
    }

    fn serialize_properties(
        &mut self,
        serializer: &mut dyn NetSerializer,
        mask: &mut DirtyMask,
    ) -> Result<(), PropertyError> {
        serializer.align()?;
        let mut raw = mask.raw();
        serializer.serialize_varu64(&mut raw, "dirty_mask")?;
        let decoded = DirtyMask::from_raw(raw);
        let count = self.values.len();
        if let Some(bit) = decoded.iter().find(|bit| *bit >= count) {
            #[allow(clippy::cast_possible_truncation)]
            return Err(PropertyError::UnknownProperty {
                bit: bit as u32,
                count,
            });
        }

        match serializer.mode() {
            SerializerMode::WriteToBuffer => {
                for index in decoded.iter() {
                    let mut value = self.values[index];
                    serialize_value(serializer, &self.def.properties[index], &mut value)?;
                }
            }
            SerializerMode::ReadFromBuffer => {
                // Decode everything before committing so a corrupt payload
                // leaves the component untouched.
                let mut decoded_values = Vec::with_capacity(decoded.len() as usize);
                for index in decoded.iter() {
                    let mut value = self.values[index];
                    serialize_value(serializer, &self.def.properties[index], &mut value)?;
                    decoded_values.push((index, value));
                }
                serializer.align()?;
                let bits = serializer.bits_remaining();
                if bits != 0 {
                    return Err(PropertyError::TrailingData { bits });
                }
                for (index, value) in decoded_values {
                    self.values[index] = value;
                    self.baseline[index] = value;
                }
                // An authority that accepts remote input forwards it to its
                // other observers.
                if self.role == NetEntityRole::Authority {
                    self.mark_dirty(decoded);
                }
                *mask = decoded;
            }
        }
        Ok(())
    }

    fn notify_property_changes(&mut self, mask: DirtyMask) {
        for index in mask.iter() {
            if let (Some(def), Some(value)) = (self.def.properties.get(index), self.values.get(index))
            {
                self.changes.push(PropertyChange {
                    property: def.id,
                    value: *value,
                });
            }
        }
    }
}
