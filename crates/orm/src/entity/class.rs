//! Static entity class registry
//!
//! The engine never inspects Rust types at runtime. Every entity class is
//! described once by an [`EntityClassDef`] (table, columns, inheritance
//! sources, relation declarations, cascade annotations, and named accessor
//! overrides) registered into a process-wide [`ClassRegistry`]. Registration
//! happens at startup or first use; definitions are immutable afterward.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::entity::{Entity, EntityId, RelationSlot};
use crate::error::{OrmError, OrmResult};
use crate::session::Session;

/// Visibility of a property declaration on its originating class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    /// Honored only on the class that declares it, never through inheritance
    Private,
}

/// One raw relation declaration attached to a property
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDeclaration {
    /// The property carrying the declaration
    pub property: String,
    /// Declaration visibility, governs inheritance
    pub visibility: Visibility,
    /// The raw declaration value (flat or dotted option map)
    pub declaration: Value,
}

/// A cascade-delete rule: deleting rows of the declaring class deletes rows
/// of `target_class` whose `target_column` matches the declaring class's
/// `property` values. `target_column` defaults to the target's primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeDeleteDeclaration {
    pub property: String,
    pub target_class: String,
    pub target_column: Option<String>,
}

/// Class-level annotation data
#[derive(Debug, Clone, PartialEq)]
pub struct ClassAnnotation {
    /// Whether cascade-persist may descend into entities of this class
    pub cascade_persist: bool,
    /// Cascade-delete rules declared on this class
    pub cascade_delete: Vec<CascadeDeleteDeclaration>,
}

impl Default for ClassAnnotation {
    fn default() -> Self {
        Self {
            cascade_persist: true,
            cascade_delete: Vec::new(),
        }
    }
}

/// One level of the declaration resolution walk
#[derive(Debug, Clone)]
pub struct DeclarationLevel {
    /// The class or mixin the declarations are written on
    pub origin: String,
    /// The class the declarations belong to. Mixin declarations belong to
    /// the class using the mixin; parent declarations stay on the parent.
    pub owner: String,
    /// True for parent levels; private declarations are skipped there
    pub inherited: bool,
    pub declarations: Vec<PropertyDeclaration>,
}

/// Override for reading a relation-backed value off an entity
pub type RelationGetter = Arc<dyn Fn(&Entity) -> RelationSlot + Send + Sync>;

/// Override for writing a relation-backed value onto an entity
pub type RelationSetter = Arc<dyn Fn(&mut Entity, RelationSlot) + Send + Sync>;

/// Arguments handed to a junction factory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JunctionContext {
    /// The entity the mutation was invoked on
    pub initiator: EntityId,
    /// Value for the junction's current-side accessor
    pub current: EntityId,
    /// Value for the junction's related-side accessor
    pub related: EntityId,
}

/// Callback creating a junction entity for a manyToMany relation
pub type JunctionFactory =
    dyn Fn(&mut Session, &JunctionContext) -> OrmResult<EntityId> + Send + Sync;

/// Static description of one entity class
#[derive(Clone)]
pub struct EntityClassDef {
    pub name: String,
    pub table: String,
    /// Parent class in the declaration resolution chain
    pub parent: Option<String>,
    /// Mixin sources, in priority order
    pub mixins: Vec<String>,
    /// Column-backed properties
    pub columns: Vec<String>,
    /// Primary key columns, used for the session identity map
    pub primary_keys: Vec<String>,
    /// Relation declarations attached to properties of this class
    pub declarations: Vec<PropertyDeclaration>,
    /// Class-level cascade annotation
    pub annotation: ClassAnnotation,
    getters: HashMap<String, RelationGetter>,
    setters: HashMap<String, RelationSetter>,
}

impl fmt::Debug for EntityClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityClassDef")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("parent", &self.parent)
            .field("mixins", &self.mixins)
            .field("columns", &self.columns)
            .field("primary_keys", &self.primary_keys)
            .field("declarations", &self.declarations)
            .field("annotation", &self.annotation)
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .field("setters", &self.setters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EntityClassDef {
    /// Create a class definition with the conventional single `id` primary key
    pub fn new(name: &str, table: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            parent: None,
            mixins: Vec::new(),
            columns: Vec::new(),
            primary_keys: vec!["id".to_string()],
            declarations: Vec::new(),
            annotation: ClassAnnotation::default(),
            getters: HashMap::new(),
            setters: HashMap::new(),
        }
    }

    /// Set the parent class
    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }

    /// Append a mixin source (priority follows call order)
    pub fn with_mixin(mut self, mixin: &str) -> Self {
        self.mixins.push(mixin.to_string());
        self
    }

    /// Append a column-backed property
    pub fn with_column(mut self, column: &str) -> Self {
        self.columns.push(column.to_string());
        self
    }

    /// Replace the primary key columns
    pub fn with_primary_keys(mut self, keys: Vec<String>) -> Self {
        self.primary_keys = keys;
        self
    }

    /// Attach a public relation declaration to a property
    pub fn with_declaration(mut self, property: &str, declaration: Value) -> Self {
        self.with_declaration_visibility(property, Visibility::Public, declaration)
    }

    /// Attach a relation declaration with explicit visibility
    pub fn with_declaration_visibility(
        mut self,
        property: &str,
        visibility: Visibility,
        declaration: Value,
    ) -> Self {
        self.declarations.push(PropertyDeclaration {
            property: property.to_string(),
            visibility,
            declaration,
        });
        self
    }

    /// Set the class-level cascade-persist flag
    pub fn with_cascade_persist(mut self, allowed: bool) -> Self {
        self.annotation.cascade_persist = allowed;
        self
    }

    /// Append a cascade-delete rule
    pub fn with_cascade_delete(
        mut self,
        property: &str,
        target_class: &str,
        target_column: Option<&str>,
    ) -> Self {
        self.annotation.cascade_delete.push(CascadeDeleteDeclaration {
            property: property.to_string(),
            target_class: target_class.to_string(),
            target_column: target_column.map(str::to_string),
        });
        self
    }

    /// Register a named getter override
    pub fn with_getter<F>(mut self, name: &str, getter: F) -> Self
    where
        F: Fn(&Entity) -> RelationSlot + Send + Sync + 'static,
    {
        self.getters.insert(name.to_string(), Arc::new(getter));
        self
    }

    /// Register a named setter override
    pub fn with_setter<F>(mut self, name: &str, setter: F) -> Self
    where
        F: Fn(&mut Entity, RelationSlot) + Send + Sync + 'static,
    {
        self.setters.insert(name.to_string(), Arc::new(setter));
        self
    }

    /// Look up a getter override by name
    pub fn getter(&self, name: &str) -> Option<RelationGetter> {
        self.getters.get(name).cloned()
    }

    /// Look up a setter override by name
    pub fn setter(&self, name: &str) -> Option<RelationSetter> {
        self.setters.get(name).cloned()
    }

    /// Whether a property is known to this class (column or declared relation)
    pub fn has_property(&self, property: &str) -> bool {
        self.columns.iter().any(|c| c == property)
            || self.declarations.iter().any(|d| d.property == property)
    }
}

/// Thread-safe, write-once-read-many registry of entity class definitions
#[derive(Clone, Default)]
pub struct ClassRegistry {
    classes: Arc<DashMap<String, Arc<EntityClassDef>>>,
    factories: Arc<DashMap<String, Arc<JunctionFactory>>>,
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.classes.len())
            .field("factories", &self.factories.len())
            .finish()
    }
}

impl ClassRegistry {
    /// Create a new empty class registry
    pub fn new() -> Self {
        Self {
            classes: Arc::new(DashMap::new()),
            factories: Arc::new(DashMap::new()),
        }
    }

    /// Register a class definition. Cascade-delete rules referencing unknown
    /// properties of the class fail fast here; target classes are validated
    /// when the delete mapping is first resolved, since registration order
    /// is not constrained.
    pub fn register(&self, def: EntityClassDef) -> OrmResult<()> {
        for rule in &def.annotation.cascade_delete {
            if !def.columns.iter().any(|c| c == &rule.property) {
                return Err(OrmError::Configuration(format!(
                    "cascade-delete rule on '{}' references unknown property '{}'",
                    def.name, rule.property
                )));
            }
        }
        if self.classes.contains_key(&def.name) {
            return Err(OrmError::Configuration(format!(
                "entity class '{}' is already registered",
                def.name
            )));
        }
        self.classes.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// Register a named junction factory
    pub fn register_factory<F>(&self, name: &str, factory: F)
    where
        F: Fn(&mut Session, &JunctionContext) -> OrmResult<EntityId> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Look up a class definition
    pub fn get(&self, class: &str) -> Option<Arc<EntityClassDef>> {
        self.classes.get(class).map(|entry| entry.clone())
    }

    /// Look up a class definition, failing with a configuration error
    pub fn expect(&self, class: &str) -> OrmResult<Arc<EntityClassDef>> {
        self.get(class).ok_or_else(|| {
            OrmError::Configuration(format!("entity class '{}' is not registered", class))
        })
    }

    /// Whether a class is registered
    pub fn has_class(&self, class: &str) -> bool {
        self.classes.contains_key(class)
    }

    /// Look up a junction factory by name
    pub fn factory(&self, name: &str) -> Option<Arc<JunctionFactory>> {
        self.factories.get(name).map(|entry| entry.clone())
    }

    /// Whether a junction factory is registered
    pub fn has_factory(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Whether `class` is `ancestor` or inherits from it through parents
    pub fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        if class == ancestor {
            return true;
        }
        let mut visited = vec![class.to_string()];
        let mut current = self.get(class).and_then(|def| def.parent.clone());
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            if visited.contains(&parent) {
                break;
            }
            current = self.get(&parent).and_then(|def| def.parent.clone());
            visited.push(parent);
        }
        false
    }

    /// The declaration resolution walk for a class: own level, own mixins,
    /// then each ancestor followed by its mixins. Mixin declarations belong
    /// to the class using the mixin.
    pub fn declaration_levels(&self, class: &str) -> OrmResult<Vec<DeclarationLevel>> {
        let mut levels = Vec::new();
        let mut visited: Vec<String> = Vec::new();
        let mut current = Some(class.to_string());
        let mut first = true;
        while let Some(name) = current {
            if visited.contains(&name) {
                return Err(OrmError::Configuration(format!(
                    "class '{}' appears twice in the inheritance chain of '{}'",
                    name, class
                )));
            }
            visited.push(name.clone());
            let def = self.get(&name).ok_or_else(|| {
                OrmError::Configuration(format!(
                    "class '{}' in the inheritance chain of '{}' is not registered",
                    name, class
                ))
            })?;
            levels.push(DeclarationLevel {
                origin: name.clone(),
                owner: name.clone(),
                inherited: !first,
                declarations: def.declarations.clone(),
            });
            for mixin in &def.mixins {
                let mixin_def = self.get(mixin).ok_or_else(|| {
                    OrmError::Configuration(format!(
                        "mixin '{}' of class '{}' is not registered",
                        mixin, name
                    ))
                })?;
                levels.push(DeclarationLevel {
                    origin: mixin.clone(),
                    owner: name.clone(),
                    inherited: !first,
                    declarations: mixin_def.declarations.clone(),
                });
            }
            current = def.parent.clone();
            first = false;
        }
        Ok(levels)
    }
}

/// Global class registry instance for the application
static GLOBAL_CLASSES: Lazy<ClassRegistry> = Lazy::new(ClassRegistry::new);

/// Get the global class registry
pub fn global_classes() -> &'static ClassRegistry {
    &GLOBAL_CLASSES
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_class_registration_and_lookup() {
        let registry = ClassRegistry::new();
        registry
            .register(EntityClassDef::new("User", "users").with_column("id"))
            .unwrap();

        assert!(registry.has_class("User"));
        assert!(!registry.has_class("Post"));
        let def = registry.get("User").unwrap();
        assert_eq!(def.table, "users");
        assert_eq!(def.primary_keys, vec!["id".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = ClassRegistry::new();
        registry
            .register(EntityClassDef::new("User", "users"))
            .unwrap();
        let err = registry
            .register(EntityClassDef::new("User", "users"))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_cascade_delete_rule_requires_known_property() {
        let registry = ClassRegistry::new();
        let def = EntityClassDef::new("User", "users")
            .with_column("id")
            .with_cascade_delete("missing", "Post", None);
        let err = registry.register(def).unwrap_err();
        assert!(err.to_string().contains("unknown property 'missing'"));
    }

    #[test]
    fn test_declaration_levels_priority_order() {
        let registry = ClassRegistry::new();
        registry
            .register(EntityClassDef::new("Timestamps", "-"))
            .unwrap();
        registry
            .register(EntityClassDef::new("Base", "base").with_mixin("Timestamps"))
            .unwrap();
        registry
            .register(
                EntityClassDef::new("User", "users")
                    .with_parent("Base")
                    .with_mixin("Timestamps"),
            )
            .unwrap();

        let levels = registry.declaration_levels("User").unwrap();
        let origins: Vec<&str> = levels.iter().map(|l| l.origin.as_str()).collect();
        assert_eq!(origins, vec!["User", "Timestamps", "Base", "Timestamps"]);
        let owners: Vec<&str> = levels.iter().map(|l| l.owner.as_str()).collect();
        assert_eq!(owners, vec!["User", "User", "Base", "Base"]);
        assert!(!levels[0].inherited);
        assert!(!levels[1].inherited);
        assert!(levels[2].inherited);
        assert!(levels[3].inherited);
    }

    #[test]
    fn test_missing_parent_is_a_configuration_error() {
        let registry = ClassRegistry::new();
        registry
            .register(EntityClassDef::new("User", "users").with_parent("Ghost"))
            .unwrap();
        let err = registry.declaration_levels("User").unwrap_err();
        assert!(err.to_string().contains("'Ghost'"));
    }

    #[test]
    fn test_subclass_walk() {
        let registry = ClassRegistry::new();
        registry
            .register(EntityClassDef::new("Animal", "animals"))
            .unwrap();
        registry
            .register(EntityClassDef::new("Dog", "dogs").with_parent("Animal"))
            .unwrap();

        assert!(registry.is_subclass_of("Dog", "Animal"));
        assert!(registry.is_subclass_of("Dog", "Dog"));
        assert!(!registry.is_subclass_of("Animal", "Dog"));
    }

    #[test]
    fn test_has_property_covers_columns_and_declarations() {
        let def = EntityClassDef::new("User", "users")
            .with_column("id")
            .with_declaration("posts", json!({"type": "oneToMany"}));
        assert!(def.has_property("id"));
        assert!(def.has_property("posts"));
        assert!(!def.has_property("name"));
    }
}
