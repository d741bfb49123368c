//! Declaration resolution across the inheritance chain
//!
//! Collects one declaration per property for a class, walking its own level,
//! its mixins, its parent, and the parent's mixins in priority order. The
//! first occurrence of a property wins. Each surviving declaration keeps the
//! class it belongs to: mixin declarations belong to the class using the
//! mixin, parent declarations stay attributed to the parent. Resolved maps
//! are cached for the process lifetime; metadata does not change at runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::entity::Visibility;
use crate::error::OrmResult;
use crate::relations::declaration::{AnnotationSource, RelationDeclaration};

/// A declaration surviving resolution, with the class it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDeclaration {
    /// The class the relation is attributed to
    pub owner: String,
    pub declaration: RelationDeclaration,
}

/// Resolved declarations for one class, keyed by property name
pub type ResolvedDeclarations = BTreeMap<String, ResolvedDeclaration>;

/// Caching resolver over an [`AnnotationSource`]
#[derive(Clone)]
pub struct DeclarationResolver {
    source: Arc<dyn AnnotationSource>,
    cache: Arc<DashMap<String, Arc<ResolvedDeclarations>>>,
}

impl DeclarationResolver {
    pub fn new(source: Arc<dyn AnnotationSource>) -> Self {
        Self {
            source,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// The annotation source backing this resolver
    pub fn source(&self) -> &Arc<dyn AnnotationSource> {
        &self.source
    }

    /// Resolve every relation declaration visible on a class.
    ///
    /// Private declarations are honored only on the class's own levels;
    /// inherited levels contribute public and protected declarations only.
    pub fn resolve(&self, class: &str) -> OrmResult<Arc<ResolvedDeclarations>> {
        if let Some(cached) = self.cache.get(class) {
            return Ok(cached.clone());
        }

        let mut resolved = ResolvedDeclarations::new();
        for level in self.source.declaration_levels(class)? {
            for declared in &level.declarations {
                if level.inherited && declared.visibility == Visibility::Private {
                    continue;
                }
                if resolved.contains_key(&declared.property) {
                    continue;
                }
                let declaration = RelationDeclaration::parse(
                    &level.origin,
                    &declared.property,
                    &declared.declaration,
                )?;
                resolved.insert(
                    declared.property.clone(),
                    ResolvedDeclaration {
                        owner: level.owner.clone(),
                        declaration,
                    },
                );
            }
        }

        let resolved = Arc::new(resolved);
        self.cache.insert(class.to_string(), resolved.clone());
        Ok(resolved)
    }
}
