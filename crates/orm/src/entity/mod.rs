//! Entity records and class metadata
//!
//! Entities are plain records owned by a [`crate::session::Session`] arena.
//! Relation-backed values are stored as slots holding [`EntityId`]s, never
//! owning pointers, so circular graphs are representable and the session
//! remains the single owner of every instance.

pub mod class;
pub mod status;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::relations::collection::RelatedCollection;

pub use class::{
    global_classes, CascadeDeleteDeclaration, ClassAnnotation, ClassRegistry, DeclarationLevel,
    EntityClassDef, JunctionContext, JunctionFactory, PropertyDeclaration, RelationGetter,
    RelationSetter, Visibility,
};
pub use status::{EntityStatus, StatusFlag};

/// Stable, session-issued identity of an entity instance.
///
/// Identity keys are monotonically issued, never reused, and key every
/// relation collection, cycle guard, and identity map in the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Storage for one relation-backed property
#[derive(Debug, Clone, PartialEq)]
pub enum RelationSlot {
    /// toOne storage: a single optional reference
    Single(Option<EntityId>),
    /// toMany storage: an identity-keyed collection
    Many(RelatedCollection),
}

impl RelationSlot {
    /// The slot's single reference, if it is toOne storage
    pub fn as_single(&self) -> Option<Option<EntityId>> {
        match self {
            RelationSlot::Single(value) => Some(*value),
            RelationSlot::Many(_) => None,
        }
    }

    /// The slot's collection, if it is toMany storage
    pub fn as_many(&self) -> Option<&RelatedCollection> {
        match self {
            RelationSlot::Single(_) => None,
            RelationSlot::Many(collection) => Some(collection),
        }
    }
}

/// One entity instance: column fields, persistence status, and relation slots
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    class: String,
    fields: Map<String, Value>,
    original: Map<String, Value>,
    status: EntityStatus,
    slots: HashMap<String, RelationSlot>,
    mid_slots: HashMap<String, RelatedCollection>,
    initialized_relations: HashSet<String>,
    persisted_id: Option<Uuid>,
}

impl Entity {
    pub(crate) fn new(id: EntityId, class: &str, fields: Map<String, Value>) -> Self {
        Self {
            id,
            class: class.to_string(),
            original: fields.clone(),
            fields,
            status: EntityStatus::new(),
            slots: HashMap::new(),
            mid_slots: HashMap::new(),
            initialized_relations: HashSet::new(),
            persisted_id: None,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// Read a column field
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Write a column field
    pub fn set_field(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Replace every column field, e.g. with storage-synchronized values
    pub fn replace_fields(&mut self, fields: Map<String, Value>) {
        self.fields = fields;
    }

    /// Whether any field's serialized value drifted from the last synced
    /// snapshot, compared field by field
    pub fn is_dirty(&self) -> bool {
        if self.fields.len() != self.original.len() {
            return true;
        }
        self.fields
            .iter()
            .any(|(name, value)| self.original.get(name) != Some(value))
    }

    /// Snapshot the current fields as the synced baseline
    pub fn mark_synced(&mut self) {
        self.original = self.fields.clone();
    }

    pub fn status(&self) -> EntityStatus {
        self.status
    }

    pub fn set_status(&mut self, flag: StatusFlag, on: bool) {
        self.status.set(flag, on);
    }

    pub fn has_status(&self, flag: StatusFlag) -> bool {
        self.status.has(flag)
    }

    /// Read a relation slot by relation name
    pub fn slot(&self, relation: &str) -> Option<&RelationSlot> {
        self.slots.get(relation)
    }

    pub fn set_slot(&mut self, relation: &str, slot: RelationSlot) {
        self.slots.insert(relation.to_string(), slot);
    }

    /// Iterate relation slots in unspecified order
    pub fn slots(&self) -> impl Iterator<Item = (&String, &RelationSlot)> {
        self.slots.iter()
    }

    /// Read a junction collection by relation name
    pub fn mid_collection(&self, relation: &str) -> Option<&RelatedCollection> {
        self.mid_slots.get(relation)
    }

    pub fn set_mid_collection(&mut self, relation: &str, collection: RelatedCollection) {
        self.mid_slots.insert(relation.to_string(), collection);
    }

    /// Iterate junction collections in unspecified order
    pub fn mid_collections(&self) -> impl Iterator<Item = (&String, &RelatedCollection)> {
        self.mid_slots.iter()
    }

    pub(crate) fn relation_initialized(&self, relation: &str) -> bool {
        self.initialized_relations.contains(relation)
    }

    pub(crate) fn mark_relation_initialized(&mut self, relation: &str) {
        self.initialized_relations.insert(relation.to_string());
    }

    /// The persisted id, if this entity was registered for persistence
    pub fn persisted_id(&self) -> Option<Uuid> {
        self.persisted_id
    }

    /// Assign the persisted id exactly once; later calls return the first value
    pub(crate) fn assign_persisted_id(&mut self) -> Uuid {
        *self.persisted_id.get_or_insert_with(Uuid::new_v4)
    }
}
