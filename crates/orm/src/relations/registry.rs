//! Relation registry - merged configuration storage and alias index
//!
//! One store per process, keyed by entity class. Configurations are written
//! exactly once during relation definition and immutable afterward; there is
//! no removal or update API.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{OrmError, OrmResult};
use crate::relations::metadata::RelationConfig;

/// What a developer-facing alias resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasTarget {
    /// The relation-backed property itself
    Relation(String),
    /// The junction collection of a manyToMany relation
    Mid(String),
}

impl AliasTarget {
    /// The relation name behind the alias, whichever the target is
    pub fn relation_name(&self) -> &str {
        match self {
            AliasTarget::Relation(name) | AliasTarget::Mid(name) => name,
        }
    }
}

/// Thread-safe store of merged relation configurations
#[derive(Debug, Clone, Default)]
pub struct RelationRegistry {
    /// class -> relation name -> merged configuration
    relations: Arc<DashMap<String, BTreeMap<String, RelationConfig>>>,
    /// class -> property or alias -> target
    aliases: Arc<DashMap<String, BTreeMap<String, AliasTarget>>>,
    /// classes whose definition pass completed
    defined: Arc<DashMap<String, ()>>,
}

impl RelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the definition pass ran for a class
    pub fn is_defined(&self, class: &str) -> bool {
        self.defined.contains_key(class)
    }

    pub(crate) fn mark_defined(&self, class: &str) {
        self.defined.insert(class.to_string(), ());
    }

    /// Register a merged configuration and bind its aliases.
    ///
    /// Registering the identical configuration twice is a no-op returning the
    /// relation name; binding a property that already belongs to a different
    /// relation is a configuration error.
    pub fn register(&self, config: RelationConfig) -> OrmResult<String> {
        config.validate()?;
        let name = config.name();
        let class = config.owner_class.clone();

        if let Some(existing) = self.get(&class, &name) {
            if existing == config {
                return Ok(name);
            }
            return Err(OrmError::Configuration(format!(
                "relation '{}' on '{}' is already registered with a different configuration",
                name, class
            )));
        }

        self.bind_alias(
            &class,
            &config.source_property,
            AliasTarget::Relation(name.clone()),
        )?;
        if let Some(mid) = &config.mid {
            self.bind_alias(&class, &mid.property, AliasTarget::Mid(name.clone()))?;
        }

        self.relations
            .entry(class)
            .or_default()
            .insert(name.clone(), config);
        Ok(name)
    }

    /// Bind an additional alias for an already registered relation, e.g. the
    /// mirror property of a self-referential relation.
    pub(crate) fn bind_extra_alias(
        &self,
        class: &str,
        alias: &str,
        name: &str,
    ) -> OrmResult<()> {
        self.bind_alias(class, alias, AliasTarget::Relation(name.to_string()))
    }

    fn bind_alias(&self, class: &str, alias: &str, target: AliasTarget) -> OrmResult<()> {
        let mut entry = self.aliases.entry(class.to_string()).or_default();
        if let Some(existing) = entry.get(alias) {
            if existing == &target {
                return Ok(());
            }
            return Err(OrmError::Configuration(format!(
                "property '{}' on '{}' is already related to '{}'",
                alias,
                class,
                existing.relation_name()
            )));
        }
        entry.insert(alias.to_string(), target);
        Ok(())
    }

    /// Look up a configuration by relation name
    pub fn get(&self, class: &str, name: &str) -> Option<RelationConfig> {
        self.relations
            .get(class)
            .and_then(|entry| entry.get(name).cloned())
    }

    /// Look up a configuration by relation name, failing if absent
    pub fn config(&self, class: &str, name: &str) -> OrmResult<RelationConfig> {
        self.get(class, name).ok_or_else(|| OrmError::RelationNotFound {
            class: class.to_string(),
            relation: name.to_string(),
        })
    }

    /// All configurations for a class, keyed by relation name
    pub fn configs(&self, class: &str) -> BTreeMap<String, RelationConfig> {
        self.relations
            .get(class)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    /// Resolve a property name, alias, or relation name to its target
    pub fn resolve_alias(&self, class: &str, alias: &str) -> OrmResult<AliasTarget> {
        if let Some(target) = self
            .aliases
            .get(class)
            .and_then(|entry| entry.get(alias).cloned())
        {
            return Ok(target);
        }
        if self.get(class, alias).is_some() {
            return Ok(AliasTarget::Relation(alias.to_string()));
        }
        Err(OrmError::RelationNotFound {
            class: class.to_string(),
            relation: alias.to_string(),
        })
    }

    /// The relation a property is bound to, if any
    pub fn relation_for_property(&self, class: &str, property: &str) -> Option<String> {
        self.aliases
            .get(class)
            .and_then(|entry| entry.get(property).map(|t| t.relation_name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::metadata::{MidConfig, RelationKind};

    fn config() -> RelationConfig {
        RelationConfig {
            kind: RelationKind::ManyToOne,
            owner_class: "Child".to_string(),
            related_class: "Father".to_string(),
            source_property: "father".to_string(),
            related_property: "children".to_string(),
            cascade: None,
            getter: None,
            setter: None,
            mid: None,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = RelationRegistry::new();
        let name = registry.register(config()).unwrap();
        assert_eq!(name, "manyToOne__children__father");

        assert_eq!(
            registry.resolve_alias("Child", "father").unwrap(),
            AliasTarget::Relation(name.clone())
        );
        assert_eq!(
            registry.resolve_alias("Child", &name).unwrap(),
            AliasTarget::Relation(name.clone())
        );
        assert!(registry.config("Child", &name).is_ok());
    }

    #[test]
    fn test_unknown_alias_is_relation_not_found() {
        let registry = RelationRegistry::new();
        let err = registry.resolve_alias("Child", "nope").unwrap_err();
        assert!(matches!(err, OrmError::RelationNotFound { .. }));
    }

    #[test]
    fn test_idempotent_registration() {
        let registry = RelationRegistry::new();
        let first = registry.register(config()).unwrap();
        let second = registry.register(config()).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.configs("Child").len(), 1);
    }

    #[test]
    fn test_property_cannot_serve_two_relations() {
        let registry = RelationRegistry::new();
        registry.register(config()).unwrap();

        let mut other = config();
        other.related_class = "Mother".to_string();
        other.related_property = "kids".to_string();
        let err = registry.register(other).unwrap_err();
        assert!(err.to_string().contains("already related to"));
    }

    #[test]
    fn test_mid_alias_resolves_to_mid_target() {
        let registry = RelationRegistry::new();
        let mut cfg = config();
        cfg.kind = RelationKind::ManyToMany;
        cfg.source_property = "dogs".to_string();
        cfg.related_property = "persons".to_string();
        cfg.mid = Some(MidConfig {
            class: "FamilyDog".to_string(),
            factory: "family_dog".to_string(),
            property: "dog_person_relations".to_string(),
            current_property: "person".to_string(),
            related_property: "dog".to_string(),
            getter: None,
            setter: None,
        });
        let name = registry.register(cfg).unwrap();
        assert_eq!(
            registry
                .resolve_alias("Child", "dog_person_relations")
                .unwrap(),
            AliasTarget::Mid(name)
        );
    }
}
