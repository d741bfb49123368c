//! Raw relation declarations and their normalization
//!
//! Declarations arrive as JSON option maps produced by whatever annotation
//! layer the application uses. Options may be written flat and dotted
//! (`"related.class"`) or nested (`{"related": {"class": ...}}`); both forms
//! normalize to the same typed [`RelationDeclaration`]. Malformed input is a
//! configuration error naming the offending class and property.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::{ClassAnnotation, ClassRegistry, DeclarationLevel};
use crate::error::{OrmError, OrmResult};
use crate::relations::metadata::RelationKind;

/// Options describing the opposite endpoint of a relation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelatedOptions {
    /// The related entity class
    pub class: Option<String>,
    /// The mirror property on the related class
    pub property: Option<String>,
    /// Getter override for the related side (declared from this side)
    pub getter: Option<String>,
    /// Setter override for the related side (declared from this side)
    pub setter: Option<String>,
}

/// Junction-entity options for a manyToMany declaration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MidOptions {
    pub class: Option<String>,
    pub factory: Option<String>,
    /// The junction collection property on both endpoints
    pub property: Option<String>,
    pub current_property: Option<String>,
    pub related_property: Option<String>,
    pub getter: Option<String>,
    pub setter: Option<String>,
}

impl MidOptions {
    /// Whether any junction option was declared
    pub fn is_configured(&self) -> bool {
        self.class.is_some()
            || self.factory.is_some()
            || self.property.is_some()
            || self.current_property.is_some()
            || self.related_property.is_some()
            || self.getter.is_some()
            || self.setter.is_some()
    }
}

/// One normalized relation declaration, before merging with its mirror
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelationDeclaration {
    #[serde(rename = "type")]
    pub kind: Option<RelationKind>,
    pub related: RelatedOptions,
    /// Getter override for this side
    pub getter: Option<String>,
    /// Setter override for this side
    pub setter: Option<String>,
    /// Per-property cascade-persist opt-out
    pub cascade: Option<bool>,
    pub mid: MidOptions,
}

impl RelationDeclaration {
    /// Normalize and type a raw declaration value
    pub fn parse(class: &str, property: &str, raw: &Value) -> OrmResult<Self> {
        let expanded = expand_options(class, property, raw)?;
        let declaration: RelationDeclaration = serde_json::from_value(Value::Object(expanded))
            .map_err(|e| {
                OrmError::Configuration(format!(
                    "invalid relation declaration on '{}::{}': {}",
                    class, property, e
                ))
            })?;
        declaration.validate(class, property)?;
        Ok(declaration)
    }

    /// Check required options and mutually exclusive combinations
    pub fn validate(&self, class: &str, property: &str) -> OrmResult<()> {
        let kind = self.kind.ok_or_else(|| {
            OrmError::Configuration(format!(
                "required option 'type' missing on '{}::{}'",
                class, property
            ))
        })?;
        if self.related.class.is_none() {
            return Err(OrmError::Configuration(format!(
                "required option 'related.class' missing on '{}::{}'",
                class, property
            )));
        }
        if self.mid.is_configured() {
            if kind != RelationKind::ManyToMany {
                return Err(OrmError::Configuration(format!(
                    "'mid' options on '{}::{}' are only valid for manyToMany relations",
                    class, property
                )));
            }
            if self.mid.class.is_none() {
                return Err(OrmError::Configuration(format!(
                    "required option 'mid.class' missing on '{}::{}'",
                    class, property
                )));
            }
            if self.mid.factory.is_none() {
                return Err(OrmError::Configuration(format!(
                    "required option 'mid.factory' missing on '{}::{}'",
                    class, property
                )));
            }
            if let (Some(current), Some(related)) =
                (&self.mid.current_property, &self.mid.related_property)
            {
                if current == related {
                    return Err(OrmError::Configuration(format!(
                        "options 'mid.current_property' and 'mid.related_property' on '{}::{}' must differ",
                        class, property
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expand dotted option keys into nested objects, verifying that flat and
/// nested spellings of the same option do not contradict each other.
pub fn expand_options(class: &str, property: &str, raw: &Value) -> OrmResult<Map<String, Value>> {
    let source = raw.as_object().ok_or_else(|| {
        OrmError::Configuration(format!(
            "relation declaration on '{}::{}' must be an option map",
            class, property
        ))
    })?;
    let mut out = Map::new();
    for (key, value) in source {
        let path: Vec<&str> = key.split('.').collect();
        insert_path(&mut out, &path, value, class, property, key)?;
    }
    Ok(out)
}

fn insert_path(
    target: &mut Map<String, Value>,
    path: &[&str],
    value: &Value,
    class: &str,
    property: &str,
    full_key: &str,
) -> OrmResult<()> {
    if path.len() == 1 {
        match target.entry(path[0].to_string()) {
            serde_json::map::Entry::Vacant(slot) => {
                slot.insert(value.clone());
            }
            serde_json::map::Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                // Nested and dotted spellings may both contribute sub-options
                if let (Some(into), Some(from)) = (existing.as_object_mut(), value.as_object()) {
                    for (sub_key, sub_value) in from {
                        let sub_path: Vec<&str> = sub_key.split('.').collect();
                        insert_path(into, &sub_path, sub_value, class, property, full_key)?;
                    }
                } else if slot.get() != value {
                    return Err(OrmError::Configuration(format!(
                        "option '{}' on '{}::{}' is declared twice with conflicting values",
                        full_key, class, property
                    )));
                }
            }
        }
        return Ok(());
    }
    let entry = target
        .entry(path[0].to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    let nested = entry.as_object_mut().ok_or_else(|| {
        OrmError::Configuration(format!(
            "option '{}' on '{}::{}' mixes scalar and nested forms",
            full_key, class, property
        ))
    })?;
    insert_path(nested, &path[1..], value, class, property, full_key)
}

/// Flatten a nested option map back into the dotted form
pub fn flatten_options(options: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in options {
        match value.as_object() {
            Some(nested) if !nested.is_empty() => {
                for (sub_key, sub_value) in flatten_options(nested) {
                    out.insert(format!("{}.{}", key, sub_key), sub_value);
                }
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Opaque provider of per-property and per-class declarations.
///
/// The engine defines the semantics of declarations, not their serialization
/// syntax; any annotation or attribute layer can sit behind this trait.
pub trait AnnotationSource: Send + Sync {
    /// The declaration resolution walk for a class, highest priority first
    fn declaration_levels(&self, class: &str) -> OrmResult<Vec<DeclarationLevel>>;

    /// Class-level annotation data
    fn class_annotation(&self, class: &str) -> OrmResult<ClassAnnotation>;

    fn has_class(&self, class: &str) -> bool;

    fn has_getter(&self, class: &str, name: &str) -> bool;

    fn has_setter(&self, class: &str, name: &str) -> bool;

    fn has_factory(&self, name: &str) -> bool;
}

impl AnnotationSource for ClassRegistry {
    fn declaration_levels(&self, class: &str) -> OrmResult<Vec<DeclarationLevel>> {
        ClassRegistry::declaration_levels(self, class)
    }

    fn class_annotation(&self, class: &str) -> OrmResult<ClassAnnotation> {
        Ok(self.expect(class)?.annotation.clone())
    }

    fn has_class(&self, class: &str) -> bool {
        ClassRegistry::has_class(self, class)
    }

    fn has_getter(&self, class: &str, name: &str) -> bool {
        self.get(class)
            .map(|def| def.getter(name).is_some())
            .unwrap_or(false)
    }

    fn has_setter(&self, class: &str, name: &str) -> bool {
        self.get(class)
            .map(|def| def.setter(name).is_some())
            .unwrap_or(false)
    }

    fn has_factory(&self, name: &str) -> bool {
        ClassRegistry::has_factory(self, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dotted_and_nested_forms_normalize_equally() {
        let dotted = json!({
            "type": "manyToOne",
            "related.class": "Father",
            "related.property": "children"
        });
        let nested = json!({
            "type": "manyToOne",
            "related": {"class": "Father", "property": "children"}
        });
        let a = RelationDeclaration::parse("Child", "father", &dotted).unwrap();
        let b = RelationDeclaration::parse("Child", "father", &nested).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.related.class.as_deref(), Some("Father"));
    }

    #[test]
    fn test_mixed_forms_merge_without_conflict() {
        let raw = json!({
            "type": "manyToMany",
            "related.class": "Person",
            "mid": {"class": "FamilyDog"},
            "mid.factory": "family_dog"
        });
        let declaration = RelationDeclaration::parse("Dog", "persons", &raw).unwrap();
        assert_eq!(declaration.mid.class.as_deref(), Some("FamilyDog"));
        assert_eq!(declaration.mid.factory.as_deref(), Some("family_dog"));
    }

    #[test]
    fn test_conflicting_spellings_fail() {
        let raw = json!({
            "type": "manyToOne",
            "related.class": "Father",
            "related": {"class": "Mother"}
        });
        let err = RelationDeclaration::parse("Child", "father", &raw).unwrap_err();
        assert!(err.to_string().contains("conflicting values"));
        assert!(err.to_string().contains("Child::father"));
    }

    #[test]
    fn test_unknown_option_fails() {
        let raw = json!({
            "type": "manyToOne",
            "related.class": "Father",
            "surprising": true
        });
        let err = RelationDeclaration::parse("Child", "father", &raw).unwrap_err();
        assert!(err.to_string().contains("Child::father"));
    }

    #[test]
    fn test_missing_type_fails() {
        let raw = json!({"related.class": "Father"});
        let err = RelationDeclaration::parse("Child", "father", &raw).unwrap_err();
        assert!(err.to_string().contains("'type' missing"));
    }

    #[test]
    fn test_mid_options_require_many_to_many() {
        let raw = json!({
            "type": "oneToMany",
            "related.class": "Child",
            "mid.class": "FamilyDog"
        });
        let err = RelationDeclaration::parse("Father", "children", &raw).unwrap_err();
        assert!(err.to_string().contains("only valid for manyToMany"));
    }

    #[test]
    fn test_mid_factory_required_with_mid_class() {
        let raw = json!({
            "type": "manyToMany",
            "related.class": "Person",
            "mid.class": "FamilyDog"
        });
        let err = RelationDeclaration::parse("Dog", "persons", &raw).unwrap_err();
        assert!(err.to_string().contains("'mid.factory' missing"));
    }

    #[test]
    fn test_flatten_round_trip() {
        let raw = json!({
            "type": "manyToOne",
            "related.class": "Father"
        });
        let expanded = expand_options("Child", "father", &raw).unwrap();
        let flattened = flatten_options(&expanded);
        assert_eq!(flattened.get("related.class"), Some(&json!("Father")));
        assert_eq!(flattened.get("type"), Some(&json!("manyToOne")));
    }
}
