//! Relation metadata - merged relation configurations

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{OrmError, OrmResult};
use crate::relations::naming;

/// Defines the kind of relation between entity classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// One-to-one relation; both endpoints hold a single reference
    #[serde(rename = "oneToOne")]
    OneToOne,
    /// One-to-many relation; this endpoint holds the collection
    #[serde(rename = "oneToMany")]
    OneToMany,
    /// Many-to-one relation; this endpoint holds the single reference
    #[serde(rename = "manyToOne")]
    ManyToOne,
    /// Many-to-many relation, optionally through a junction entity
    #[serde(rename = "manyToMany")]
    ManyToMany,
}

impl RelationKind {
    /// Returns true if this endpoint stores a keyed collection
    pub fn is_collection(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    /// The kind the opposite endpoint must carry for the pair to be valid
    pub fn mapped(self) -> RelationKind {
        match self {
            Self::OneToOne => Self::OneToOne,
            Self::OneToMany => Self::ManyToOne,
            Self::ManyToOne => Self::OneToMany,
            Self::ManyToMany => Self::ManyToMany,
        }
    }

    /// Returns true if a relation of this kind may target its own class
    pub fn allows_self_mapping(self) -> bool {
        matches!(self, Self::OneToOne | Self::ManyToMany)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneToOne => "oneToOne",
            Self::OneToMany => "oneToMany",
            Self::ManyToOne => "manyToOne",
            Self::ManyToMany => "manyToMany",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Junction-entity configuration for a manyToMany relation
#[derive(Debug, Clone, PartialEq)]
pub struct MidConfig {
    /// The junction entity class
    pub class: String,
    /// Name of the registered factory creating junction records
    pub factory: String,
    /// The junction collection property on both endpoints
    pub property: String,
    /// Accessor property on the record resolving to the initiating side
    pub current_property: String,
    /// Accessor property on the record resolving to the related side
    pub related_property: String,
    /// Optional getter override for the junction collection
    pub getter: Option<String>,
    /// Optional setter override for the junction collection
    pub setter: Option<String>,
}

/// One merged relation endpoint, keyed by `(owner_class, name())`
#[derive(Debug, Clone, PartialEq)]
pub struct RelationConfig {
    pub kind: RelationKind,
    pub owner_class: String,
    pub related_class: String,
    /// The property on the owner holding the relation value or collection
    pub source_property: String,
    /// The property on the related class holding the mirror
    pub related_property: String,
    /// Per-property cascade-persist opt-out (`Some(false)` blocks descent)
    pub cascade: Option<bool>,
    /// Optional getter override, registered on the owner class
    pub getter: Option<String>,
    /// Optional setter override, registered on the owner class
    pub setter: Option<String>,
    /// Junction configuration, manyToMany only
    pub mid: Option<MidConfig>,
}

impl RelationConfig {
    /// The canonical relation name, unique per owner class
    pub fn name(&self) -> String {
        naming::relation_name(self.kind, &self.related_property, &self.source_property)
    }

    /// Whether the relation targets the owner class itself
    pub fn is_self_referential(&self) -> bool {
        self.owner_class == self.related_class
    }

    /// Validate the merged configuration for consistency
    pub fn validate(&self) -> OrmResult<()> {
        if self.mid.is_some() && self.kind != RelationKind::ManyToMany {
            return Err(OrmError::Configuration(format!(
                "relation '{}::{}' of type {} cannot carry a mid configuration",
                self.owner_class, self.source_property, self.kind
            )));
        }
        if self.is_self_referential() && !self.kind.allows_self_mapping() {
            return Err(OrmError::Configuration(format!(
                "relation '{}::{}' of type {} cannot target its own class",
                self.owner_class, self.source_property, self.kind
            )));
        }
        if let Some(mid) = &self.mid {
            if mid.current_property == mid.related_property {
                return Err(OrmError::Configuration(format!(
                    "mid accessor properties of '{}::{}' must be different, both are '{}'",
                    self.owner_class, self.source_property, mid.current_property
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kind: RelationKind) -> RelationConfig {
        RelationConfig {
            kind,
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
    fn test_kind_predicates() {
        assert!(RelationKind::OneToMany.is_collection());
        assert!(RelationKind::ManyToMany.is_collection());
        assert!(!RelationKind::OneToOne.is_collection());
        assert!(!RelationKind::ManyToOne.is_collection());

        assert!(RelationKind::OneToOne.allows_self_mapping());
        assert!(RelationKind::ManyToMany.allows_self_mapping());
        assert!(!RelationKind::OneToMany.allows_self_mapping());
    }

    #[test]
    fn test_mapped_pairs() {
        assert_eq!(RelationKind::OneToMany.mapped(), RelationKind::ManyToOne);
        assert_eq!(RelationKind::ManyToOne.mapped(), RelationKind::OneToMany);
        assert_eq!(RelationKind::OneToOne.mapped(), RelationKind::OneToOne);
        assert_eq!(RelationKind::ManyToMany.mapped(), RelationKind::ManyToMany);
    }

    #[test]
    fn test_relation_name_is_deterministic() {
        let cfg = config(RelationKind::ManyToOne);
        assert_eq!(cfg.name(), "manyToOne__children__father");
    }

    #[test]
    fn test_mid_requires_many_to_many() {
        let mut cfg = config(RelationKind::OneToMany);
        cfg.mid = Some(MidConfig {
            class: "Mid".to_string(),
            factory: "mid".to_string(),
            property: "mids".to_string(),
            current_property: "a".to_string(),
            related_property: "b".to_string(),
            getter: None,
            setter: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_self_mapping_restriction() {
        let mut cfg = config(RelationKind::ManyToOne);
        cfg.related_class = "Child".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("cannot target its own class"));
    }
}
