//! Cascading entity manager - persist traversal and the flush protocol
//!
//! Cascade-persist walks the object graph through the property values each
//! entity currently holds, so reachability depends on mirrored state, not on
//! a declared direction: once `child.set(father)` has mirrored `child` into
//! `father`'s collection, persisting `father` reaches `child` too. The walk
//! is cycle-guarded by entity identity.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cascade::delete::{self, StructureCache};
use crate::entity::{ClassRegistry, EntityId, RelationSlot, StatusFlag};
use crate::error::{OrmError, OrmResult};
use crate::relations::RelationManager;
use crate::session::Session;
use crate::store::{EntityFactory, EntityRecord, EntityStore, SessionContext};

/// Options for one flush call
#[derive(Debug, Clone)]
pub struct FlushOptions {
    /// Cascade override for resolving an explicit target set:
    /// `Some(true)` forces descent, `Some(false)` disables it entirely
    pub cascade_persist: Option<bool>,
    /// Whether deletions fan out through the cascade-delete mapping
    pub cascade_delete: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            cascade_persist: None,
            cascade_delete: true,
        }
    }
}

/// Coordinates cascading persistence and deletion over a session
pub struct EntityManager {
    relations: RelationManager,
    classes: ClassRegistry,
    store: Arc<dyn EntityStore>,
    context: Arc<dyn SessionContext>,
    /// persisted-id -> entity, the set of entities registered for persistence
    persisted: HashMap<Uuid, EntityId>,
}

impl EntityManager {
    pub fn new(
        relations: RelationManager,
        store: Arc<dyn EntityStore>,
        context: Arc<dyn SessionContext>,
    ) -> Self {
        let classes = relations.classes().clone();
        Self {
            relations,
            classes,
            store,
            context,
            persisted: HashMap::new(),
        }
    }

    pub fn relations(&self) -> &RelationManager {
        &self.relations
    }

    /// Register an entity graph for persistence with default cascade rules
    pub fn persist(&mut self, session: &mut Session, entities: &[EntityId]) -> OrmResult<()> {
        self.persist_with(session, entities, None)
    }

    /// Register an entity graph for persistence. `cascade` overrides the
    /// class-level opt-out: `Some(true)` forces descent, `Some(false)`
    /// disables it; `None` honors the per-class annotation. The per-property
    /// opt-out always wins.
    pub fn persist_with(
        &mut self,
        session: &mut Session,
        entities: &[EntityId],
        cascade: Option<bool>,
    ) -> OrmResult<()> {
        let mut traveled = BTreeSet::new();
        self.travel(session, entities, true, cascade, &mut traveled, 1)
    }

    /// Whether an entity is registered for persistence (O(1) by persisted id)
    pub fn is_persisted(&self, session: &Session, entity: EntityId) -> bool {
        session
            .entity(entity)
            .ok()
            .and_then(|record| record.persisted_id())
            .map_or(false, |pid| self.persisted.contains_key(&pid))
    }

    /// The entities currently registered for persistence, in identity order
    pub fn persisted_entities(&self) -> Vec<EntityId> {
        let ids: BTreeSet<EntityId> = self.persisted.values().copied().collect();
        ids.into_iter().collect()
    }

    /// Drop every persistence registration
    pub fn clear(&mut self) {
        self.persisted.clear();
    }

    /// Depth-first graph traversal with cycle detection.
    ///
    /// The root call always traverses its entities; nested calls descend into
    /// an entity only if cascade is not explicitly disabled and the entity's
    /// class allows cascade persist (or the override forces it). Collection
    /// values are always walked into; each member is then gated by the same
    /// eligibility rule. Properties with a cascade opt-out are skipped.
    pub fn travel(
        &mut self,
        session: &mut Session,
        entities: &[EntityId],
        persist: bool,
        cascade: Option<bool>,
        traveled: &mut BTreeSet<EntityId>,
        depth: u32,
    ) -> OrmResult<()> {
        for &entity in entities {
            session.entity(entity)?;
            if depth > 1 && !self.descend_eligible(session, entity, cascade)? {
                continue;
            }
            if traveled.contains(&entity) {
                continue;
            }
            traveled.insert(entity);
            self.relations.initialize(session, entity)?;
            if persist {
                let pid = session.entity_mut(entity)?.assign_persisted_id();
                self.persisted.insert(pid, entity);
            }

            let class = session.entity(entity)?.class_name().to_string();
            let configs = self.relations.configs_for(&class)?;
            let mut singles: Vec<EntityId> = Vec::new();
            let mut groups: Vec<Vec<EntityId>> = Vec::new();
            {
                let record = session.entity(entity)?;
                for (name, config) in &configs {
                    if config.cascade == Some(false) {
                        continue;
                    }
                    match record.slot(name) {
                        Some(RelationSlot::Single(Some(value))) => singles.push(*value),
                        Some(RelationSlot::Many(collection)) => groups.push(collection.ids()),
                        _ => {}
                    }
                    if let Some(records) = record.mid_collection(name) {
                        groups.push(records.ids());
                    }
                }
            }
            for group in groups {
                self.travel(session, &group, persist, cascade, traveled, depth + 1)?;
            }
            for single in singles {
                self.travel(session, &[single], persist, cascade, traveled, depth + 1)?;
            }
        }
        Ok(())
    }

    fn descend_eligible(
        &self,
        session: &Session,
        entity: EntityId,
        cascade: Option<bool>,
    ) -> OrmResult<bool> {
        Ok(match cascade {
            Some(false) => false,
            Some(true) => true,
            None => {
                let class = session.entity(entity)?.class_name().to_string();
                self.classes.expect(&class)?.annotation.cascade_persist
            }
        })
    }

    /// Flush every entity registered for persistence
    pub async fn flush(&mut self, session: &mut Session) -> OrmResult<()> {
        self.flush_with(session, None, FlushOptions::default()).await
    }

    /// Flush an explicit entity set (traveled, without registering it for
    /// persistence) or, when `entities` is `None`, everything persisted.
    pub async fn flush_with(
        &mut self,
        session: &mut Session,
        entities: Option<Vec<EntityId>>,
        options: FlushOptions,
    ) -> OrmResult<()> {
        let implicit = entities.is_none();
        let targets: Vec<EntityId> = match entities {
            Some(list) => {
                let mut traveled = BTreeSet::new();
                self.travel(
                    session,
                    &list,
                    false,
                    options.cascade_persist,
                    &mut traveled,
                    1,
                )?;
                traveled.into_iter().collect()
            }
            None => self.persisted_entities(),
        };
        if targets.is_empty() {
            return Ok(());
        }

        // derive statuses from field drift unless explicitly flagged, and
        // group the work by entity class
        let mut groups: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for &entity in &targets {
            let record = session.entity_mut(entity)?;
            if !record.has_status(StatusFlag::Modified)
                && !record.has_status(StatusFlag::ToDelete)
                && record.has_status(StatusFlag::Exist)
                && record.is_dirty()
            {
                record.set_status(StatusFlag::Modified, true);
            }
            groups
                .entry(record.class_name().to_string())
                .or_default()
                .push(entity);
        }

        // partition into insert/update/delete and note not-null foreign keys
        // still holding an application-assigned placeholder
        let mut structures = StructureCache::new(self.store.clone());
        let mut inserts: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        let mut updates: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        let mut deletes: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        let mut placeholder_watch: Vec<(EntityId, String, i64)> = Vec::new();
        for (class, members) in &groups {
            let structure = structures.get(class).await?;
            for &entity in members {
                let record = session.entity(entity)?;
                if record.has_status(StatusFlag::ToDelete) {
                    if record.status().is_delete_eligible() {
                        deletes.entry(class.clone()).or_default().push(entity);
                    }
                    continue;
                }
                if record.has_status(StatusFlag::Deleted) {
                    continue;
                }
                for column in structure.foreign_keys.keys() {
                    if !structure.not_null.contains(column) {
                        continue;
                    }
                    if let Some(value) = record.field(column).and_then(Value::as_i64) {
                        if value < 0 {
                            placeholder_watch.push((entity, column.clone(), value));
                        }
                    }
                }
                if !record.has_status(StatusFlag::Exist) {
                    inserts.entry(class.clone()).or_default().push(entity);
                } else if record.status().is_update_eligible() {
                    updates.entry(class.clone()).or_default().push(entity);
                }
            }
        }
        if inserts.is_empty() && updates.is_empty() && deletes.is_empty() {
            if implicit {
                self.persisted.clear();
            }
            return Ok(());
        }

        let opened = self.context.begin_transaction().await?;
        debug!(opened, "flush starting");
        let result = self
            .flush_inner(
                session,
                &mut structures,
                inserts,
                updates,
                deletes,
                placeholder_watch,
                &options,
            )
            .await;
        match result {
            Ok(()) => {
                if opened {
                    self.context.commit().await?;
                }
                if implicit {
                    self.persisted.clear();
                }
                Ok(())
            }
            Err(error) => {
                if opened {
                    if let Err(rollback_error) = self.context.rollback().await {
                        warn!(%rollback_error, "rollback after failed flush also failed");
                    }
                }
                Err(error)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn flush_inner(
        &mut self,
        session: &mut Session,
        structures: &mut StructureCache,
        inserts: BTreeMap<String, Vec<EntityId>>,
        updates: BTreeMap<String, Vec<EntityId>>,
        deletes: BTreeMap<String, Vec<EntityId>>,
        placeholder_watch: Vec<(EntityId, String, i64)>,
        options: &FlushOptions,
    ) -> OrmResult<()> {
        // constraint checking is deferred for the whole flush so write order
        // across class groups cannot trip foreign keys
        self.context.set_deferred_constraints().await?;

        // placeholder value -> realized value, filled by the insert pass
        let mut placeholder_map: HashMap<i64, Value> = HashMap::new();

        for (class, members) in &inserts {
            let repository = self.store.repository(class)?;
            let records = snapshot_records(session, class, members)?;
            let synced = repository.insert(records).await?;
            if synced.len() != members.len() {
                return Err(OrmError::Database(format!(
                    "repository for '{}' returned {} records for {} inserted entities",
                    class,
                    synced.len(),
                    members.len()
                )));
            }
            let structure = structures.get(class).await?;
            for (&entity, synced_record) in members.iter().zip(synced) {
                for pk in &structure.primary_keys {
                    let old = session.entity(entity)?.field(pk).and_then(Value::as_i64);
                    if let (Some(old), Some(new_value)) = (old, synced_record.fields.get(pk)) {
                        if old < 0 {
                            placeholder_map.insert(old, new_value.clone());
                        }
                    }
                }
                let record = session.entity_mut(entity)?;
                record.replace_fields(synced_record.fields);
                record.set_status(StatusFlag::Exist, true);
                record.set_status(StatusFlag::Modified, false);
                record.mark_synced();
                session.index_identity(entity)?;
            }
            debug!(class = %class, rows = members.len(), "inserted");
        }

        for (class, members) in &updates {
            let repository = self.store.repository(class)?;
            let records = snapshot_records(session, class, members)?;
            let synced = repository.update(records).await?;
            if synced.len() != members.len() {
                return Err(OrmError::Database(format!(
                    "repository for '{}' returned {} records for {} updated entities",
                    class,
                    synced.len(),
                    members.len()
                )));
            }
            for (&entity, synced_record) in members.iter().zip(synced) {
                let record = session.entity_mut(entity)?;
                record.replace_fields(synced_record.fields);
                record.set_status(StatusFlag::Modified, false);
                record.mark_synced();
            }
            debug!(class = %class, rows = members.len(), "updated");
        }

        let mut deleted_seeds: BTreeMap<String, Vec<EntityRecord>> = BTreeMap::new();
        for (class, members) in &deletes {
            let repository = self.store.repository(class)?;
            let records = snapshot_records(session, class, members)?;
            let removed = repository.delete(records).await?;
            for &entity in members {
                let record = session.entity_mut(entity)?;
                record.set_status(StatusFlag::ToDelete, false);
                record.set_status(StatusFlag::Exist, false);
                record.set_status(StatusFlag::Deleted, true);
            }
            debug!(class = %class, rows = members.len(), "deleted");
            deleted_seeds.insert(class.clone(), removed);
        }

        // second pass: placeholder foreign keys whose referenced rows were
        // just realized are substituted and flushed again
        let mut second: BTreeMap<String, Vec<EntityId>> = BTreeMap::new();
        for (entity, column, placeholder) in placeholder_watch {
            let substituted = placeholder_map.get(&placeholder).cloned();
            let record = session.entity_mut(entity)?;
            if let Some(real) = substituted {
                if record.field(&column).and_then(Value::as_i64) == Some(placeholder) {
                    record.set_field(&column, real);
                }
            }
            let changed = record.field(&column).and_then(Value::as_i64) != Some(placeholder);
            if changed {
                record.set_status(StatusFlag::Modified, true);
                if record.status().is_update_eligible() {
                    second
                        .entry(record.class_name().to_string())
                        .or_default()
                        .push(entity);
                }
            }
        }
        for (class, members) in &second {
            let repository = self.store.repository(class)?;
            let records = snapshot_records(session, class, members)?;
            let synced = repository.update(records).await?;
            for (&entity, synced_record) in members.iter().zip(synced) {
                let record = session.entity_mut(entity)?;
                record.replace_fields(synced_record.fields);
                record.set_status(StatusFlag::Modified, false);
                record.mark_synced();
            }
            debug!(class = %class, rows = members.len(), "realized placeholder keys");
        }

        if options.cascade_delete && !deleted_seeds.is_empty() {
            let roots: Vec<String> = deleted_seeds.keys().cloned().collect();
            let mapping = delete::resolve_mapping(&self.classes, structures, roots).await?;
            let removed = delete::run(&self.store, structures, &mapping, deleted_seeds).await?;
            // reflect cascade deletions on session entities known by identity
            for record in removed {
                if let Some(entity) = session.identity_lookup(&record.class, &record.fields) {
                    let known = session.entity_mut(entity)?;
                    known.set_status(StatusFlag::ToDelete, false);
                    known.set_status(StatusFlag::Exist, false);
                    known.set_status(StatusFlag::Deleted, true);
                }
            }
        }
        Ok(())
    }

    /// Materialize a stored row as a reference-only proxy entity
    pub fn create_proxy(
        &self,
        session: &mut Session,
        class: &str,
        values: Map<String, Value>,
    ) -> OrmResult<EntityId> {
        if let Some(existing) = session.identity_lookup(class, &values) {
            return Ok(existing);
        }
        let entity = session.new_entity(class, values)?;
        {
            let record = session.entity_mut(entity)?;
            record.set_status(StatusFlag::Exist, true);
            record.set_status(StatusFlag::Proxy, true);
            record.mark_synced();
        }
        session.index_identity(entity)?;
        self.relations.initialize(session, entity)?;
        Ok(entity)
    }
}

impl EntityFactory for EntityManager {
    fn create_entity(
        &self,
        session: &mut Session,
        class: &str,
        values: Map<String, Value>,
    ) -> OrmResult<EntityId> {
        if let Some(existing) = session.identity_lookup(class, &values) {
            let record = session.entity_mut(existing)?;
            record.replace_fields(values);
            record.set_status(StatusFlag::Exist, true);
            record.set_status(StatusFlag::Proxy, false);
            record.mark_synced();
            self.relations.initialize(session, existing)?;
            self.relations.sync_all(session, existing)?;
            return Ok(existing);
        }
        let entity = session.new_entity(class, values)?;
        {
            let record = session.entity_mut(entity)?;
            record.set_status(StatusFlag::Exist, true);
            record.mark_synced();
        }
        session.index_identity(entity)?;
        self.relations.initialize(session, entity)?;
        Ok(entity)
    }

    fn entity_ref(
        &self,
        session: &Session,
        class: &str,
        values: &Map<String, Value>,
    ) -> Option<EntityId> {
        session.identity_lookup(class, values)
    }
}

fn snapshot_records(
    session: &Session,
    class: &str,
    members: &[EntityId],
) -> OrmResult<Vec<EntityRecord>> {
    members
        .iter()
        .map(|&entity| {
            let record = session.entity(entity)?;
            Ok(EntityRecord {
                entity: Some(entity),
                class: class.to_string(),
                fields: record.fields().clone(),
            })
        })
        .collect()
}
