//! Two-sided relation configuration merging
//!
//! A relation may be declared on one endpoint, on both, or partially on each.
//! The merger locates the declaration on the related class, combines the two
//! option sets into one complete configuration per endpoint, synthesizes
//! implicit property names, and registers both sides. Options shared by both
//! endpoints (the relation type and every `mid.*` option) must not conflict;
//! per-slot options (accessors, the junction orientation properties) must not
//! be declared from both sides at once.

use crate::error::{OrmError, OrmResult};
use crate::relations::declaration::{MidOptions, RelatedOptions, RelationDeclaration};
use crate::relations::metadata::{MidConfig, RelationConfig, RelationKind};
use crate::relations::naming;
use crate::relations::registry::RelationRegistry;
use crate::relations::resolver::DeclarationResolver;

/// Merges declarations into registered [`RelationConfig`]s
#[derive(Clone)]
pub struct ConfigMerger {
    resolver: DeclarationResolver,
    registry: RelationRegistry,
}

impl ConfigMerger {
    pub fn new(resolver: DeclarationResolver, registry: RelationRegistry) -> Self {
        Self { resolver, registry }
    }

    pub fn resolver(&self) -> &DeclarationResolver {
        &self.resolver
    }

    /// Run the definition pass for a class once: resolve every declaration
    /// and merge it. A failed pass surfaces its configuration error and is
    /// not retried.
    pub fn ensure_defined(&self, class: &str) -> OrmResult<()> {
        if self.registry.is_defined(class) {
            return Ok(());
        }
        self.registry.mark_defined(class);
        let declarations = self.resolver.resolve(class)?;
        for (property, resolved) in declarations.iter() {
            self.merge_relation(&resolved.owner, property, resolved.declaration.clone(), None)?;
        }
        Ok(())
    }

    /// Merge one declaration into a registered relation, returning the
    /// relation name. Idempotent: an already-processed `(class, property)`
    /// pair returns its cached name.
    pub fn merge_relation(
        &self,
        owner: &str,
        property: &str,
        decl: RelationDeclaration,
        registered_opposite: Option<&str>,
    ) -> OrmResult<String> {
        if let Some(existing) = self.registry.relation_for_property(owner, property) {
            let config = self.registry.config(owner, &existing)?;
            let kind_matches = decl.kind.map_or(true, |k| k == config.kind);
            let class_matches = decl
                .related
                .class
                .as_deref()
                .map_or(true, |c| c == config.related_class);
            if kind_matches && class_matches {
                return Ok(existing);
            }
            return Err(OrmError::Configuration(format!(
                "property '{}' on '{}' is already related to '{}'",
                property, owner, existing
            )));
        }

        decl.validate(owner, property)?;
        let kind = decl.kind.expect("validated above");
        let related_class = decl.related.class.clone().expect("validated above");
        let source = self.resolver.source();

        if !source.has_class(&related_class) {
            return Err(OrmError::Configuration(format!(
                "related class '{}' declared on '{}::{}' is not registered",
                related_class, owner, property
            )));
        }
        let self_referential = related_class == owner;
        if self_referential && !kind.allows_self_mapping() {
            return Err(OrmError::Configuration(format!(
                "relation '{}::{}' of type {} cannot target its own class",
                owner, property, kind
            )));
        }

        // Locate the related side's declaration, if one exists and the
        // opposite endpoint is not already registered.
        let mut other: Option<(String, String, RelationDeclaration)> = None;
        if registered_opposite.is_none() {
            let related_decls = self.resolver.resolve(&related_class)?;
            if let Some(explicit) = &decl.related.property {
                if let Some(candidate) = related_decls.get(explicit) {
                    let points_back = candidate.declaration.related.class.as_deref()
                        == Some(owner)
                        && candidate
                            .declaration
                            .related
                            .property
                            .as_deref()
                            .map_or(true, |p| p == property);
                    if !points_back {
                        return Err(OrmError::Configuration(format!(
                            "relation '{}::{}' names related property '{}::{}', which does not point back",
                            owner, property, related_class, explicit
                        )));
                    }
                    other = Some((
                        explicit.clone(),
                        candidate.owner.clone(),
                        candidate.declaration.clone(),
                    ));
                }
            } else {
                for (candidate_property, candidate) in related_decls.iter() {
                    if self_referential && candidate_property == property {
                        continue;
                    }
                    if candidate.declaration.related.class.as_deref() == Some(owner)
                        && candidate
                            .declaration
                            .related
                            .property
                            .as_deref()
                            .map_or(true, |p| p == property)
                    {
                        other = Some((
                            candidate_property.clone(),
                            candidate.owner.clone(),
                            candidate.declaration.clone(),
                        ));
                        break;
                    }
                }
            }
        }

        // Fold the located declaration into ours.
        let mut merged = decl.clone();
        if let Some((other_property, _, other_decl)) = &other {
            if let Some(other_kind) = other_decl.kind {
                if other_kind != kind.mapped() {
                    return Err(OrmError::Configuration(format!(
                        "conflicting relation types: {} on '{}::{}' is not mapped to {} on '{}::{}'",
                        kind, owner, property, other_kind, related_class, other_property
                    )));
                }
            }
            let at = ConflictSite {
                owner,
                property,
                related_class: &related_class,
                other_property,
            };
            merged.mid.class =
                merge_unoverridable(merged.mid.class, other_decl.mid.class.clone(), "mid.class", &at)?;
            merged.mid.factory = merge_unoverridable(
                merged.mid.factory,
                other_decl.mid.factory.clone(),
                "mid.factory",
                &at,
            )?;
            merged.mid.property = merge_unoverridable(
                merged.mid.property,
                other_decl.mid.property.clone(),
                "mid.property",
                &at,
            )?;
            merged.mid.getter = merge_unoverridable(
                merged.mid.getter,
                other_decl.mid.getter.clone(),
                "mid.getter",
                &at,
            )?;
            merged.mid.setter = merge_unoverridable(
                merged.mid.setter,
                other_decl.mid.setter.clone(),
                "mid.setter",
                &at,
            )?;
            // The orientation properties swap across sides: our current slot
            // is the other side's related slot.
            merged.mid.current_property = merge_switchable(
                merged.mid.current_property,
                other_decl.mid.related_property.clone(),
                "mid.current_property",
                &at,
            )?;
            merged.mid.related_property = merge_switchable(
                merged.mid.related_property,
                other_decl.mid.current_property.clone(),
                "mid.related_property",
                &at,
            )?;
            merged.getter = merge_switchable(
                merged.getter,
                other_decl.related.getter.clone(),
                "getter",
                &at,
            )?;
            merged.setter = merge_switchable(
                merged.setter,
                other_decl.related.setter.clone(),
                "setter",
                &at,
            )?;
        }

        let related_property = decl
            .related
            .property
            .clone()
            .or_else(|| other.as_ref().map(|(p, _, _)| p.clone()))
            .unwrap_or_else(|| naming::default_related_property(owner, kind));

        let mid = if kind == RelationKind::ManyToMany && merged.mid.is_configured() {
            let mid_class = merged.mid.class.clone().expect("validated above");
            if !source.has_class(&mid_class) {
                return Err(OrmError::Configuration(format!(
                    "mid class '{}' declared on '{}::{}' is not registered",
                    mid_class, owner, property
                )));
            }
            let factory = merged.mid.factory.clone().expect("validated above");
            if !source.has_factory(&factory) {
                return Err(OrmError::Configuration(format!(
                    "junction factory '{}' declared on '{}::{}' is not registered",
                    factory, owner, property
                )));
            }
            let mid_property = merged
                .mid
                .property
                .clone()
                .unwrap_or_else(|| naming::default_mid_property(owner, &related_class));
            let current_property = merged
                .mid
                .current_property
                .clone()
                .unwrap_or_else(|| naming::snake_case(naming::short_name(owner)));
            let mut mid_related_property = merged
                .mid
                .related_property
                .clone()
                .unwrap_or_else(|| naming::snake_case(naming::short_name(&related_class)));
            if mid_related_property == current_property {
                mid_related_property = format!("{}_related", mid_related_property);
            }
            Some(MidConfig {
                class: mid_class,
                factory,
                property: mid_property,
                current_property,
                related_property: mid_related_property,
                getter: merged.mid.getter.clone(),
                setter: merged.mid.setter.clone(),
            })
        } else {
            None
        };

        self.check_accessor(owner, property, merged.getter.as_deref(), true)?;
        self.check_accessor(owner, property, merged.setter.as_deref(), false)?;
        if let Some(mid_config) = &mid {
            self.check_accessor(owner, property, mid_config.getter.as_deref(), true)?;
            self.check_accessor(owner, property, mid_config.setter.as_deref(), false)?;
        }

        let config = RelationConfig {
            kind,
            owner_class: owner.to_string(),
            related_class: related_class.clone(),
            source_property: property.to_string(),
            related_property: related_property.clone(),
            cascade: merged.cascade,
            getter: merged.getter.clone(),
            setter: merged.setter.clone(),
            mid: mid.clone(),
        };
        let name = self.registry.register(config)?;

        // A self-referential oneToOne or manyToMany is its own mirror; a
        // single merged configuration serves both directions.
        if self_referential && kind.allows_self_mapping() {
            if related_property != property {
                self.registry
                    .bind_extra_alias(owner, &related_property, &name)?;
            }
            return Ok(name);
        }

        if registered_opposite.is_none() {
            let at = ConflictSite {
                owner,
                property,
                related_class: &related_class,
                other_property: &related_property,
            };
            let opposite_getter = merge_switchable(
                other.as_ref().and_then(|(_, _, d)| d.getter.clone()),
                decl.related.getter.clone(),
                "getter",
                &at,
            )?;
            let opposite_setter = merge_switchable(
                other.as_ref().and_then(|(_, _, d)| d.setter.clone()),
                decl.related.setter.clone(),
                "setter",
                &at,
            )?;
            let opposite = RelationDeclaration {
                kind: Some(kind.mapped()),
                related: RelatedOptions {
                    class: Some(owner.to_string()),
                    property: Some(property.to_string()),
                    getter: None,
                    setter: None,
                },
                getter: opposite_getter,
                setter: opposite_setter,
                cascade: other.as_ref().and_then(|(_, _, d)| d.cascade),
                mid: match &mid {
                    Some(m) => MidOptions {
                        class: Some(m.class.clone()),
                        factory: Some(m.factory.clone()),
                        property: Some(m.property.clone()),
                        current_property: Some(m.related_property.clone()),
                        related_property: Some(m.current_property.clone()),
                        getter: m.getter.clone(),
                        setter: m.setter.clone(),
                    },
                    None => MidOptions::default(),
                },
            };
            // Register the mirror under the class the located declaration
            // belongs to; a synthesized mirror lands on the related class.
            let opposite_owner = other
                .as_ref()
                .map(|(_, o, _)| o.clone())
                .unwrap_or_else(|| related_class.clone());
            self.merge_relation(&opposite_owner, &related_property, opposite, Some(&name))?;
        }

        Ok(name)
    }

    fn check_accessor(
        &self,
        class: &str,
        property: &str,
        accessor: Option<&str>,
        getter: bool,
    ) -> OrmResult<()> {
        let Some(name) = accessor else {
            return Ok(());
        };
        let source = self.resolver.source();
        let found = if getter {
            source.has_getter(class, name)
        } else {
            source.has_setter(class, name)
        };
        if found {
            Ok(())
        } else {
            Err(OrmError::Configuration(format!(
                "{} '{}' referenced by '{}::{}' is not registered",
                if getter { "getter" } else { "setter" },
                name,
                class,
                property
            )))
        }
    }
}

struct ConflictSite<'a> {
    owner: &'a str,
    property: &'a str,
    related_class: &'a str,
    other_property: &'a str,
}

/// Options that describe the same shared slot on both sides: values must
/// agree when declared twice.
fn merge_unoverridable(
    ours: Option<String>,
    theirs: Option<String>,
    option: &str,
    at: &ConflictSite<'_>,
) -> OrmResult<Option<String>> {
    match (ours, theirs) {
        (Some(a), Some(b)) if a != b => Err(OrmError::Configuration(format!(
            "option '{}' is declared with conflicting values on '{}::{}' and '{}::{}'",
            option, at.owner, at.property, at.related_class, at.other_property
        ))),
        (a, b) => Ok(a.or(b)),
    }
}

/// Options owned by exactly one side: declaring the same logical slot from
/// both sides is ambiguous even when the values agree.
fn merge_switchable(
    ours: Option<String>,
    theirs: Option<String>,
    option: &str,
    at: &ConflictSite<'_>,
) -> OrmResult<Option<String>> {
    match (ours, theirs) {
        (Some(_), Some(_)) => Err(OrmError::Configuration(format!(
            "option '{}' for '{}::{}' is declared on both sides of the relation with '{}::{}'",
            option, at.owner, at.property, at.related_class, at.other_property
        ))),
        (a, b) => Ok(a.or(b)),
    }
}
