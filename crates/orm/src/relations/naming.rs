//! Naming conventions for synthesized relation properties

use crate::relations::metadata::RelationKind;

/// Short class name: the segment after the last `::`
pub fn short_name(class: &str) -> &str {
    class.rsplit("::").next().unwrap_or(class)
}

/// Convert a PascalCase/camelCase name to snake_case
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Simple pluralization (English-centric)
pub fn pluralize(name: &str) -> String {
    if name.ends_with('y')
        && !name.ends_with("ay")
        && !name.ends_with("ey")
        && !name.ends_with("iy")
        && !name.ends_with("oy")
        && !name.ends_with("uy")
    {
        format!("{}ies", &name[..name.len() - 1])
    } else if name.ends_with('s')
        || name.ends_with("sh")
        || name.ends_with("ch")
        || name.ends_with('x')
        || name.ends_with('z')
    {
        format!("{}es", name)
    } else {
        format!("{}s", name)
    }
}

/// Default name of the related-side property holding the owner.
///
/// ManyToOne and ManyToMany mirrors hold many owners, so the name is
/// pluralized; the toOne mirrors stay singular.
pub fn default_related_property(owner_class: &str, kind: RelationKind) -> String {
    let base = snake_case(short_name(owner_class));
    match kind {
        RelationKind::ManyToOne | RelationKind::ManyToMany => pluralize(&base),
        RelationKind::OneToOne | RelationKind::OneToMany => base,
    }
}

/// Default name of the junction collection property, deterministic across
/// both endpoints: the two snake-cased short names sorted and joined.
pub fn default_mid_property(class_a: &str, class_b: &str) -> String {
    let mut names = [
        snake_case(short_name(class_a)),
        snake_case(short_name(class_b)),
    ];
    names.sort();
    format!("{}_{}_relations", names[0], names[1])
}

/// Canonical relation name, unique per owner class
pub fn relation_name(kind: RelationKind, related_property: &str, source_property: &str) -> String {
    format!("{}__{}__{}", kind, related_property, source_property)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snake_case() {
        assert_eq!(snake_case("FamilyMember"), "family_member");
        assert_eq!(snake_case("Dog"), "dog");
        assert_eq!(snake_case("already_snake"), "already_snake");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("dog"), "dogs");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("boy"), "boys");
        assert_eq!(pluralize("box"), "boxes");
    }

    #[test]
    fn test_default_related_property_pluralizes_many_sides() {
        assert_eq!(
            default_related_property("FamilyMember", RelationKind::ManyToOne),
            "family_members"
        );
        assert_eq!(
            default_related_property("FamilyMember", RelationKind::OneToOne),
            "family_member"
        );
        assert_eq!(
            default_related_property("Dog", RelationKind::ManyToMany),
            "dogs"
        );
    }

    #[test]
    fn test_default_mid_property_is_sorted() {
        assert_eq!(default_mid_property("Person", "Dog"), "dog_person_relations");
        assert_eq!(default_mid_property("Dog", "Person"), "dog_person_relations");
    }

    #[test]
    fn test_relation_name_format() {
        assert_eq!(
            relation_name(RelationKind::OneToMany, "father", "children"),
            "oneToMany__father__children"
        );
    }
}
