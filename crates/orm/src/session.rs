//! Session - the unit of work owning every entity instance
//!
//! Entities live in a session arena and refer to each other through
//! [`EntityId`]s, so arbitrarily cyclic graphs are representable without
//! ownership cycles. A session belongs to one logical unit of work (one
//! request); it is not meant to be shared across threads.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};

use crate::entity::{ClassRegistry, Entity, EntityId};
use crate::error::{OrmError, OrmResult};

/// Arena and identity map for one unit of work
#[derive(Debug, Clone)]
pub struct Session {
    classes: ClassRegistry,
    entities: BTreeMap<EntityId, Entity>,
    /// (class, primary key values) -> entity
    identity: HashMap<(String, String), EntityId>,
    next_id: u64,
    next_placeholder: i64,
}

impl Session {
    pub fn new(classes: ClassRegistry) -> Self {
        Self {
            classes,
            entities: BTreeMap::new(),
            identity: HashMap::new(),
            next_id: 1,
            next_placeholder: -1,
        }
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    /// Create a new entity of a registered class. The identity key is issued
    /// monotonically and never reused.
    pub fn new_entity(&mut self, class: &str, fields: Map<String, Value>) -> OrmResult<EntityId> {
        self.classes.expect(class)?;
        let id = EntityId(self.next_id);
        self.next_id += 1;
        self.entities.insert(id, Entity::new(id, class, fields));
        Ok(id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn entity(&self, id: EntityId) -> OrmResult<&Entity> {
        self.entities.get(&id).ok_or(OrmError::UnknownEntity(id))
    }

    pub fn entity_mut(&mut self, id: EntityId) -> OrmResult<&mut Entity> {
        self.entities.get_mut(&id).ok_or(OrmError::UnknownEntity(id))
    }

    /// Iterate every entity in identity order
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Issue an application-assigned placeholder for a not-yet-known key:
    /// a negative sentinel, monotonically decreasing, unique per session.
    pub fn placeholder(&mut self) -> i64 {
        let value = self.next_placeholder;
        self.next_placeholder -= 1;
        value
    }

    /// Whether a field value looks like a session-issued placeholder
    pub fn is_placeholder(value: &Value) -> bool {
        value.as_i64().map_or(false, |v| v < 0)
    }

    /// Index an entity in the identity map once its primary key is complete
    pub fn index_identity(&mut self, id: EntityId) -> OrmResult<()> {
        let entity = self.entity(id)?;
        let class = entity.class_name().to_string();
        if let Some(key) = self.identity_key(&class, entity.fields()) {
            self.identity.insert((class, key), id);
        }
        Ok(())
    }

    /// Identity-map lookup by class and primary key values
    pub fn identity_lookup(&self, class: &str, values: &Map<String, Value>) -> Option<EntityId> {
        let key = self.identity_key(class, values)?;
        self.identity.get(&(class.to_string(), key)).copied()
    }

    fn identity_key(&self, class: &str, values: &Map<String, Value>) -> Option<String> {
        let def = self.classes.get(class)?;
        let mut parts = Vec::with_capacity(def.primary_keys.len());
        for pk in &def.primary_keys {
            match values.get(pk) {
                Some(value) if !value.is_null() => parts.push(value.to_string()),
                _ => return None,
            }
        }
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityClassDef;
    use serde_json::json;

    fn classes() -> ClassRegistry {
        let classes = ClassRegistry::new();
        classes
            .register(EntityClassDef::new("User", "users").with_column("id"))
            .unwrap();
        classes
    }

    #[test]
    fn test_identity_keys_are_monotonic_and_unique() {
        let mut session = Session::new(classes());
        let a = session.new_entity("User", Map::new()).unwrap();
        let b = session.new_entity("User", Map::new()).unwrap();
        assert!(b > a);
        assert!(session.contains(a));
    }

    #[test]
    fn test_unknown_class_is_rejected() {
        let mut session = Session::new(classes());
        assert!(session.new_entity("Ghost", Map::new()).is_err());
    }

    #[test]
    fn test_unknown_entity_lookup_fails() {
        let session = Session::new(classes());
        let err = session.entity(EntityId(42)).unwrap_err();
        assert!(matches!(err, OrmError::UnknownEntity(EntityId(42))));
    }

    #[test]
    fn test_placeholders_decrease_monotonically() {
        let mut session = Session::new(classes());
        let first = session.placeholder();
        let second = session.placeholder();
        assert_eq!(first, -1);
        assert_eq!(second, -2);
        assert!(Session::is_placeholder(&json!(first)));
        assert!(!Session::is_placeholder(&json!(7)));
    }

    #[test]
    fn test_identity_map_round_trip() {
        let mut session = Session::new(classes());
        let mut fields = Map::new();
        fields.insert("id".to_string(), json!(7));
        let id = session.new_entity("User", fields.clone()).unwrap();
        session.index_identity(id).unwrap();

        assert_eq!(session.identity_lookup("User", &fields), Some(id));

        let mut other = Map::new();
        other.insert("id".to_string(), json!(8));
        assert_eq!(session.identity_lookup("User", &other), None);
    }

    #[test]
    fn test_incomplete_primary_key_is_not_indexed() {
        let mut session = Session::new(classes());
        let id = session.new_entity("User", Map::new()).unwrap();
        session.index_identity(id).unwrap();
        assert!(session.identity_lookup("User", &Map::new()).is_none());
    }
}
