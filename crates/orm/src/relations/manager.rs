//! Relation graph manager - the mutation engine keeping both sides in sync
//!
//! Every public operation resolves a developer-facing alias to a merged
//! relation, makes sure the entity's relation storage is initialized, and
//! then mutates both endpoints of the relation. Mutual recursion between the
//! two sides terminates through idempotence: a `set` to the value already
//! held and an `add`/`remove` of a member already present/absent are no-ops.

use tracing::debug;

use crate::entity::{ClassRegistry, EntityId, JunctionContext, RelationSlot};
use crate::error::{OrmError, OrmResult};
use crate::relations::collection::RelatedCollection;
use crate::relations::declaration::AnnotationSource;
use crate::relations::metadata::{MidConfig, RelationConfig, RelationKind};
use crate::relations::merge::ConfigMerger;
use crate::relations::registry::{AliasTarget, RelationRegistry};
use crate::relations::resolver::DeclarationResolver;
use crate::relations::state;
use crate::session::Session;

/// Value of a relation-backed property, as returned by [`RelationManager::get`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationValue {
    /// toOne relations resolve to a single optional reference
    Single(Option<EntityId>),
    /// toMany relations and junction aliases resolve to the member list
    Collection(Vec<EntityId>),
}

/// Public API over `(class, relation, entity)` triples
#[derive(Clone)]
pub struct RelationManager {
    classes: ClassRegistry,
    registry: RelationRegistry,
    merger: ConfigMerger,
}

impl RelationManager {
    pub fn new(classes: ClassRegistry) -> Self {
        let source: std::sync::Arc<dyn AnnotationSource> =
            std::sync::Arc::new(classes.clone());
        let resolver = DeclarationResolver::new(source);
        let registry = RelationRegistry::new();
        let merger = ConfigMerger::new(resolver, registry.clone());
        Self {
            classes,
            registry,
            merger,
        }
    }

    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    pub fn registry(&self) -> &RelationRegistry {
        &self.registry
    }

    /// Run the relation definition pass for a class (idempotent)
    pub fn ensure_defined(&self, class: &str) -> OrmResult<()> {
        self.merger.ensure_defined(class)
    }

    /// The inheritance chain of a class, most derived first
    fn class_chain(&self, class: &str) -> Vec<String> {
        let mut chain = vec![class.to_string()];
        let mut current = self.classes.get(class).and_then(|def| def.parent.clone());
        while let Some(parent) = current {
            if chain.contains(&parent) {
                break;
            }
            current = self.classes.get(&parent).and_then(|def| def.parent.clone());
            chain.push(parent);
        }
        chain
    }

    /// Every relation an entity of this class carries, own and inherited.
    /// A property shadowed by a more derived declaration wins.
    pub fn configs_for(&self, class: &str) -> OrmResult<std::collections::BTreeMap<String, RelationConfig>> {
        let mut merged = std::collections::BTreeMap::new();
        let mut seen_properties = std::collections::HashSet::new();
        for cls in self.class_chain(class) {
            self.merger.ensure_defined(&cls)?;
            for (name, config) in self.registry.configs(&cls) {
                if seen_properties.insert(config.source_property.clone()) {
                    merged.insert(name, config);
                }
            }
        }
        Ok(merged)
    }

    /// Initialize relation storage for an entity and sync mirror state once.
    /// Re-invoking after initialization is a no-op.
    pub fn initialize(&self, session: &mut Session, entity: EntityId) -> OrmResult<()> {
        let class = session.entity(entity)?.class_name().to_string();
        let configs = self.configs_for(&class)?;
        if state::initialize_entity(&configs, session, entity)? {
            self.sync_all(session, entity)?;
        }
        Ok(())
    }

    /// Read a relation-backed property or junction collection
    pub fn get(
        &self,
        session: &mut Session,
        entity: EntityId,
        alias: &str,
    ) -> OrmResult<RelationValue> {
        let (config, target) = self.resolve_target(session, entity, alias)?;
        match target {
            AliasTarget::Relation(name) => {
                match self.read_slot(session, entity, &name, &config)? {
                    RelationSlot::Single(value) => Ok(RelationValue::Single(value)),
                    RelationSlot::Many(collection) => {
                        Ok(RelationValue::Collection(collection.ids()))
                    }
                }
            }
            AliasTarget::Mid(name) => Ok(RelationValue::Collection(
                self.read_mid(session, entity, &name, &config)?.ids(),
            )),
        }
    }

    /// Assign a toOne relation, detaching the previous value and attaching
    /// the mirror on the new one. Assigning the value already held is a no-op.
    pub fn set(
        &self,
        session: &mut Session,
        entity: EntityId,
        alias: &str,
        value: Option<EntityId>,
    ) -> OrmResult<()> {
        let (config, target) = self.resolve_target(session, entity, alias)?;
        let name = target.relation_name().to_string();
        if matches!(target, AliasTarget::Mid(_)) {
            return Err(junction_is_managed(&config, alias));
        }
        if config.kind.is_collection() {
            return Err(OrmError::RelationNotFound {
                class: config.owner_class.clone(),
                relation: format!("{} (toMany relations use add/remove)", alias),
            });
        }

        let current = match self.read_slot(session, entity, &name, &config)? {
            RelationSlot::Single(current) => current,
            RelationSlot::Many(_) => {
                return Err(OrmError::Configuration(format!(
                    "storage for '{}::{}' must be a single reference",
                    config.owner_class, config.source_property
                )))
            }
        };
        if current == value {
            return Ok(());
        }
        if let Some(next) = value {
            self.type_check(session, &config, next)?;
        }
        debug!(
            relation = %name,
            owner = %entity,
            "assigning toOne relation"
        );

        match config.kind {
            RelationKind::OneToOne => {
                self.write_slot(session, entity, &name, &config, RelationSlot::Single(value))?;
                if let Some(previous) = current {
                    self.set(session, previous, &config.related_property, None)?;
                }
                if let Some(next) = value {
                    self.set(session, next, &config.related_property, Some(entity))?;
                }
            }
            RelationKind::ManyToOne => {
                if let Some(previous) = current {
                    self.remove_related(session, previous, &config.related_property, entity)?;
                }
                self.write_slot(session, entity, &name, &config, RelationSlot::Single(value))?;
                if let Some(next) = value {
                    self.add_related(session, next, &config.related_property, entity)?;
                }
            }
            RelationKind::OneToMany | RelationKind::ManyToMany => unreachable!(),
        }
        Ok(())
    }

    /// Add a member to a toMany relation, mirroring the opposite side and
    /// managing the shared junction record where one is configured. Adding a
    /// member already present is a no-op returning success.
    pub fn add_related(
        &self,
        session: &mut Session,
        entity: EntityId,
        alias: &str,
        related: EntityId,
    ) -> OrmResult<()> {
        let (config, target) = self.resolve_target(session, entity, alias)?;
        let name = target.relation_name().to_string();
        if matches!(target, AliasTarget::Mid(_)) {
            return Err(junction_is_managed(&config, alias));
        }
        if !config.kind.is_collection() {
            return Err(OrmError::RelationNotFound {
                class: config.owner_class.clone(),
                relation: format!("{} (toOne relations use set)", alias),
            });
        }
        self.type_check(session, &config, related)?;

        let mut collection = self.read_collection(session, entity, &name, &config)?;
        if collection.contains(related) {
            return Ok(());
        }
        collection.insert(related);
        self.write_slot(
            session,
            entity,
            &name,
            &config,
            RelationSlot::Many(collection),
        )?;
        debug!(relation = %name, owner = %entity, related = %related, "adding related entity");

        match config.kind {
            RelationKind::ManyToMany => {
                if config.mid.is_some() {
                    self.ensure_junction(session, &config, &name, entity, related)?;
                }
                self.add_related(session, related, &config.related_property, entity)?;
            }
            RelationKind::OneToMany => {
                self.set(session, related, &config.related_property, Some(entity))?;
            }
            RelationKind::OneToOne | RelationKind::ManyToOne => unreachable!(),
        }
        Ok(())
    }

    /// Remove a member from a toMany relation, mirroring the opposite side.
    /// Removing an absent member is a no-op returning success.
    pub fn remove_related(
        &self,
        session: &mut Session,
        entity: EntityId,
        alias: &str,
        related: EntityId,
    ) -> OrmResult<()> {
        let (config, target) = self.resolve_target(session, entity, alias)?;
        let name = target.relation_name().to_string();
        if matches!(target, AliasTarget::Mid(_)) {
            return Err(junction_is_managed(&config, alias));
        }
        if !config.kind.is_collection() {
            return Err(OrmError::RelationNotFound {
                class: config.owner_class.clone(),
                relation: format!("{} (toOne relations use set)", alias),
            });
        }
        self.type_check(session, &config, related)?;

        let mut collection = self.read_collection(session, entity, &name, &config)?;
        if !collection.contains(related) {
            return Ok(());
        }
        collection.remove(related);
        self.write_slot(
            session,
            entity,
            &name,
            &config,
            RelationSlot::Many(collection),
        )?;
        debug!(relation = %name, owner = %entity, related = %related, "removing related entity");

        match config.kind {
            RelationKind::ManyToMany => {
                if config.mid.is_some() {
                    self.detach_junction(session, &config, &name, entity, related)?;
                }
                self.remove_related(session, related, &config.related_property, entity)?;
            }
            RelationKind::OneToMany => {
                self.set(session, related, &config.related_property, None)?;
            }
            RelationKind::OneToOne | RelationKind::ManyToOne => unreachable!(),
        }
        Ok(())
    }

    /// Membership test by identity key, type-checked against the relation
    pub fn has_related(
        &self,
        session: &mut Session,
        entity: EntityId,
        alias: &str,
        related: EntityId,
    ) -> OrmResult<bool> {
        let (config, target) = self.resolve_target(session, entity, alias)?;
        let name = target.relation_name().to_string();
        if let AliasTarget::Mid(_) = target {
            return self.has_mid_relation(session, entity, alias, related);
        }
        self.type_check(session, &config, related)?;
        match self.read_slot(session, entity, &name, &config)? {
            RelationSlot::Single(value) => Ok(value == Some(related)),
            RelationSlot::Many(collection) => Ok(collection.contains(related)),
        }
    }

    /// Membership test for a junction record in the entity's mid collection
    pub fn has_mid_relation(
        &self,
        session: &mut Session,
        entity: EntityId,
        alias: &str,
        record: EntityId,
    ) -> OrmResult<bool> {
        let (config, target) = self.resolve_target(session, entity, alias)?;
        let name = target.relation_name().to_string();
        let mid = config.mid.clone().ok_or_else(|| OrmError::MidRelationUndefined {
            class: config.owner_class.clone(),
            relation: config.source_property.clone(),
        })?;
        let found = session.entity(record)?.class_name().to_string();
        if !self.classes.is_subclass_of(&found, &mid.class) {
            return Err(OrmError::TypeMismatch {
                class: config.owner_class.clone(),
                property: mid.property.clone(),
                expected: mid.class.clone(),
                found,
            });
        }
        Ok(self.read_mid(session, entity, &name, &config)?.contains(record))
    }

    /// Re-derive canonical storage for one relation and re-establish mirror
    /// consistency, e.g. after hydration wrote raw property values.
    pub fn sync(&self, session: &mut Session, entity: EntityId, alias: &str) -> OrmResult<()> {
        let (config, target) = self.resolve_target(session, entity, alias)?;
        let name = target.relation_name().to_string();
        match self.read_slot(session, entity, &name, &config)? {
            RelationSlot::Many(collection) => {
                let members = collection.ids();
                self.write_slot(
                    session,
                    entity,
                    &name,
                    &config,
                    RelationSlot::Many(RelatedCollection::new()),
                )?;
                for member in members {
                    self.add_related(session, entity, &name, member)?;
                }
            }
            RelationSlot::Single(Some(value)) => {
                self.write_slot(session, entity, &name, &config, RelationSlot::Single(None))?;
                self.set(session, entity, &name, Some(value))?;
            }
            RelationSlot::Single(None) => {}
        }
        Ok(())
    }

    /// Sync every relation of an entity
    pub fn sync_all(&self, session: &mut Session, entity: EntityId) -> OrmResult<()> {
        let class = session.entity(entity)?.class_name().to_string();
        for name in self.configs_for(&class)?.into_keys() {
            self.sync(session, entity, &name)?;
        }
        Ok(())
    }

    fn resolve_target(
        &self,
        session: &mut Session,
        entity: EntityId,
        alias: &str,
    ) -> OrmResult<(RelationConfig, AliasTarget)> {
        let class = session.entity(entity)?.class_name().to_string();
        self.initialize(session, entity)?;
        self.resolve_for_class(&class, alias)
    }

    /// Resolve an alias against a class, walking its inheritance chain
    fn resolve_for_class(
        &self,
        class: &str,
        alias: &str,
    ) -> OrmResult<(RelationConfig, AliasTarget)> {
        for cls in self.class_chain(class) {
            self.merger.ensure_defined(&cls)?;
            if let Ok(target) = self.registry.resolve_alias(&cls, alias) {
                let config = self.registry.config(&cls, target.relation_name())?;
                return Ok((config, target));
            }
        }
        Err(OrmError::RelationNotFound {
            class: class.to_string(),
            relation: alias.to_string(),
        })
    }

    /// The mirror endpoint of a relation, on the related class
    fn mirror_of(&self, config: &RelationConfig) -> OrmResult<(String, RelationConfig)> {
        let (mirror, target) =
            self.resolve_for_class(&config.related_class, &config.related_property)?;
        Ok((target.relation_name().to_string(), mirror))
    }

    fn type_check(
        &self,
        session: &Session,
        config: &RelationConfig,
        related: EntityId,
    ) -> OrmResult<()> {
        let found = session.entity(related)?.class_name().to_string();
        if self.classes.is_subclass_of(&found, &config.related_class) {
            Ok(())
        } else {
            Err(OrmError::TypeMismatch {
                class: config.owner_class.clone(),
                property: config.source_property.clone(),
                expected: config.related_class.clone(),
                found,
            })
        }
    }

    fn read_collection(
        &self,
        session: &Session,
        entity: EntityId,
        name: &str,
        config: &RelationConfig,
    ) -> OrmResult<RelatedCollection> {
        match self.read_slot(session, entity, name, config)? {
            RelationSlot::Many(collection) => Ok(collection),
            RelationSlot::Single(_) => Err(OrmError::Configuration(format!(
                "storage for '{}::{}' must be a collection",
                config.owner_class, config.source_property
            ))),
        }
    }

    fn read_slot(
        &self,
        session: &Session,
        entity: EntityId,
        name: &str,
        config: &RelationConfig,
    ) -> OrmResult<RelationSlot> {
        let record = session.entity(entity)?;
        if let Some(getter_name) = &config.getter {
            let getter = self
                .classes
                .get(&config.owner_class)
                .and_then(|def| def.getter(getter_name))
                .ok_or_else(|| accessor_missing(&config.owner_class, getter_name, "getter"))?;
            return Ok(getter(record));
        }
        Ok(record
            .slot(name)
            .cloned()
            .unwrap_or_else(|| state::zero_slot(config)))
    }

    fn write_slot(
        &self,
        session: &mut Session,
        entity: EntityId,
        name: &str,
        config: &RelationConfig,
        slot: RelationSlot,
    ) -> OrmResult<()> {
        if let Some(setter_name) = &config.setter {
            let setter = self
                .classes
                .get(&config.owner_class)
                .and_then(|def| def.setter(setter_name))
                .ok_or_else(|| accessor_missing(&config.owner_class, setter_name, "setter"))?;
            setter(session.entity_mut(entity)?, slot);
            return Ok(());
        }
        session.entity_mut(entity)?.set_slot(name, slot);
        Ok(())
    }

    fn read_mid(
        &self,
        session: &Session,
        entity: EntityId,
        name: &str,
        config: &RelationConfig,
    ) -> OrmResult<RelatedCollection> {
        let mid = config.mid.as_ref().ok_or_else(|| OrmError::MidRelationUndefined {
            class: config.owner_class.clone(),
            relation: config.source_property.clone(),
        })?;
        let record = session.entity(entity)?;
        if let Some(getter_name) = &mid.getter {
            let getter = self
                .classes
                .get(&config.owner_class)
                .and_then(|def| def.getter(getter_name))
                .ok_or_else(|| accessor_missing(&config.owner_class, getter_name, "getter"))?;
            return match getter(record) {
                RelationSlot::Many(collection) => Ok(collection),
                RelationSlot::Single(_) => Err(OrmError::Configuration(format!(
                    "mid getter '{}' on '{}' must produce a collection",
                    getter_name, config.owner_class
                ))),
            };
        }
        Ok(record.mid_collection(name).cloned().unwrap_or_default())
    }

    fn write_mid(
        &self,
        session: &mut Session,
        entity: EntityId,
        name: &str,
        config: &RelationConfig,
        collection: RelatedCollection,
    ) -> OrmResult<()> {
        let mid = config.mid.as_ref().ok_or_else(|| OrmError::MidRelationUndefined {
            class: config.owner_class.clone(),
            relation: config.source_property.clone(),
        })?;
        if let Some(setter_name) = &mid.setter {
            let setter = self
                .classes
                .get(&config.owner_class)
                .and_then(|def| def.setter(setter_name))
                .ok_or_else(|| accessor_missing(&config.owner_class, setter_name, "setter"))?;
            setter(
                session.entity_mut(entity)?,
                RelationSlot::Many(collection),
            );
            return Ok(());
        }
        session.entity_mut(entity)?.set_mid_collection(name, collection);
        Ok(())
    }

    /// Find the junction record tying two entities together, in either
    /// orientation. Both accessor values must resolve to the pair.
    fn find_shared_junction(
        &self,
        session: &Session,
        mid: &MidConfig,
        records: &RelatedCollection,
        a: EntityId,
        b: EntityId,
    ) -> OrmResult<Option<EntityId>> {
        for record_id in records.iter() {
            let record = session.entity(record_id)?;
            let current = record
                .slot(&mid.current_property)
                .and_then(RelationSlot::as_single)
                .flatten();
            let related = record
                .slot(&mid.related_property)
                .and_then(RelationSlot::as_single)
                .flatten();
            let ties = (current == Some(a) && related == Some(b))
                || (current == Some(b) && related == Some(a));
            if ties {
                return Ok(Some(record_id));
            }
        }
        Ok(None)
    }

    /// Find or create the single junction record shared by both sides
    fn ensure_junction(
        &self,
        session: &mut Session,
        config: &RelationConfig,
        name: &str,
        entity: EntityId,
        related: EntityId,
    ) -> OrmResult<()> {
        let Some(mid) = config.mid.clone() else {
            return Ok(());
        };
        let (mirror_name, mirror_config) = self.mirror_of(config)?;

        let related_records = self.read_mid(session, related, &mirror_name, &mirror_config)?;
        if let Some(record) = self.find_shared_junction(session, &mid, &related_records, entity, related)? {
            // shared record exists; make sure this side holds it too
            let mut own = self.read_mid(session, entity, name, config)?;
            if own.insert(record) {
                self.write_mid(session, entity, name, config, own)?;
            }
            return Ok(());
        }

        let context = JunctionContext {
            initiator: entity,
            current: entity,
            related,
        };
        let factory = self.classes.factory(&mid.factory).ok_or_else(|| {
            OrmError::FactoryCallback {
                class: config.owner_class.clone(),
                relation: config.source_property.clone(),
                cause: format!("factory '{}' is not registered", mid.factory),
            }
        })?;
        let record = factory(session, &context).map_err(|cause| OrmError::FactoryCallback {
            class: config.owner_class.clone(),
            relation: config.source_property.clone(),
            cause: cause.to_string(),
        })?;
        let record_class = session.entity(record)?.class_name().to_string();
        if !self.classes.is_subclass_of(&record_class, &mid.class) {
            return Err(OrmError::FactoryCallback {
                class: config.owner_class.clone(),
                relation: config.source_property.clone(),
                cause: format!(
                    "expected an instance of '{}', factory returned '{}'",
                    mid.class, record_class
                ),
            });
        }
        debug!(relation = %name, record = %record, "created junction record");

        {
            let junction = session.entity_mut(record)?;
            junction.set_slot(&mid.current_property, RelationSlot::Single(Some(entity)));
            junction.set_slot(&mid.related_property, RelationSlot::Single(Some(related)));
        }

        let mut own = self.read_mid(session, entity, name, config)?;
        if own.insert(record) {
            self.write_mid(session, entity, name, config, own)?;
        }
        let mut mirror = self.read_mid(session, related, &mirror_name, &mirror_config)?;
        if mirror.insert(record) {
            self.write_mid(session, related, &mirror_name, &mirror_config, mirror)?;
        }
        Ok(())
    }

    /// Drop the shared junction record from both sides' collections and null
    /// the accessor pointing at the initiating entity. The record itself is
    /// kept as a detached, orphaned value.
    fn detach_junction(
        &self,
        session: &mut Session,
        config: &RelationConfig,
        name: &str,
        entity: EntityId,
        related: EntityId,
    ) -> OrmResult<()> {
        let Some(mid) = config.mid.clone() else {
            return Ok(());
        };
        let (mirror_name, mirror_config) = self.mirror_of(config)?;

        let own_records = self.read_mid(session, entity, name, config)?;
        let mut record = self.find_shared_junction(session, &mid, &own_records, entity, related)?;
        if record.is_none() {
            let mirror_records = self.read_mid(session, related, &mirror_name, &mirror_config)?;
            record =
                self.find_shared_junction(session, &mid, &mirror_records, entity, related)?;
        }
        let Some(record) = record else {
            return Ok(());
        };

        let mut own = self.read_mid(session, entity, name, config)?;
        if own.remove(record) {
            self.write_mid(session, entity, name, config, own)?;
        }
        let mut mirror = self.read_mid(session, related, &mirror_name, &mirror_config)?;
        if mirror.remove(record) {
            self.write_mid(session, related, &mirror_name, &mirror_config, mirror)?;
        }

        let junction = session.entity_mut(record)?;
        let current = junction
            .slot(&mid.current_property)
            .and_then(RelationSlot::as_single)
            .flatten();
        if current == Some(entity) {
            junction.set_slot(&mid.current_property, RelationSlot::Single(None));
        } else {
            junction.set_slot(&mid.related_property, RelationSlot::Single(None));
        }
        debug!(relation = %name, record = %record, "orphaned junction record");
        Ok(())
    }
}

fn junction_is_managed(config: &RelationConfig, alias: &str) -> OrmError {
    OrmError::Configuration(format!(
        "junction collection '{}' on '{}' is managed through its relation '{}'",
        alias, config.owner_class, config.source_property
    ))
}

fn accessor_missing(class: &str, name: &str, role: &str) -> OrmError {
    OrmError::Configuration(format!(
        "{} '{}' on '{}' is not registered",
        role, name, class
    ))
}
