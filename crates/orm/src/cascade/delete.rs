//! Fixed-point cascade delete
//!
//! Deleting entities may make rows of other classes deletable, which may in
//! turn fan out further. The mapping below is resolved from declarative
//! cascade-delete rules; deletion then iterates to a fixed point, issuing one
//! grouped delete per target class per pass and folding newly-deleted rows
//! back into the working set until a full pass adds nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::entity::ClassRegistry;
use crate::error::{OrmError, OrmResult};
use crate::store::{ColumnValues, EntityRecord, EntityStore, TableStructure};

/// target class -> target column -> source class -> source properties
pub(crate) type CascadeDeleteMapping =
    BTreeMap<String, BTreeMap<String, BTreeMap<String, Vec<String>>>>;

/// Lazily fetched, per-flush cache of table structures
pub(crate) struct StructureCache {
    store: Arc<dyn EntityStore>,
    cache: HashMap<String, TableStructure>,
}

impl StructureCache {
    pub(crate) fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    pub(crate) async fn get(&mut self, class: &str) -> OrmResult<TableStructure> {
        if let Some(structure) = self.cache.get(class) {
            return Ok(structure.clone());
        }
        let structure = self.store.repository(class)?.structure().await?;
        self.cache.insert(class.to_string(), structure.clone());
        Ok(structure)
    }
}

/// Resolve the cascade-delete mapping for the transitive closure of classes
/// reachable from `roots`. An implicit target column requires a single-column
/// primary key; composite keys demand an explicit mapping.
pub(crate) async fn resolve_mapping(
    classes: &ClassRegistry,
    structures: &mut StructureCache,
    roots: Vec<String>,
) -> OrmResult<CascadeDeleteMapping> {
    let mut mapping = CascadeDeleteMapping::new();
    let mut pending = roots;
    let mut seen: HashSet<String> = HashSet::new();

    while let Some(source) = pending.pop() {
        if !seen.insert(source.clone()) {
            continue;
        }
        let def = classes.expect(&source)?;
        for rule in &def.annotation.cascade_delete {
            if !classes.has_class(&rule.target_class) {
                return Err(OrmError::Configuration(format!(
                    "cascade-delete rule on '{}' references unknown class '{}'",
                    source, rule.target_class
                )));
            }
            let column = match &rule.target_column {
                Some(column) => column.clone(),
                None => {
                    let structure = structures.get(&rule.target_class).await?;
                    if structure.primary_keys.len() != 1 {
                        return Err(OrmError::PersistenceIntegrity(format!(
                            "cascade-delete into '{}' requires an explicit column mapping: composite primary key [{}]",
                            rule.target_class,
                            structure.primary_keys.join(", ")
                        )));
                    }
                    structure.primary_keys[0].clone()
                }
            };
            mapping
                .entry(rule.target_class.clone())
                .or_default()
                .entry(column)
                .or_default()
                .entry(source.clone())
                .or_default()
                .push(rule.property.clone());
            pending.push(rule.target_class.clone());
        }
    }
    Ok(mapping)
}

/// Iterate grouped deletes to a fixed point. `seeds` are the rows already
/// deleted by the flush; the return value holds every row deleted by the
/// cascade beyond them.
pub(crate) async fn run(
    store: &Arc<dyn EntityStore>,
    structures: &mut StructureCache,
    mapping: &CascadeDeleteMapping,
    seeds: BTreeMap<String, Vec<EntityRecord>>,
) -> OrmResult<Vec<EntityRecord>> {
    if mapping.is_empty() {
        return Ok(Vec::new());
    }

    let mut working = seeds;
    let mut known: HashSet<(String, String)> = HashSet::new();
    for (class, records) in &working {
        let structure = structures.get(class).await?;
        for record in records {
            known.insert((class.clone(), record_key(&structure, record)));
        }
    }

    // per (target, column, source) history of gathered values, so repeated
    // passes never requery the same keys
    let mut history: HashMap<(String, String, String), HashSet<String>> = HashMap::new();
    let mut folded: Vec<EntityRecord> = Vec::new();

    loop {
        let mut progressed = false;
        for (target, columns) in mapping {
            let mut groups: Vec<ColumnValues> = Vec::new();
            for (column, sources) in columns {
                let mut values = Vec::new();
                for (source, properties) in sources {
                    let key = (target.clone(), column.clone(), source.clone());
                    let gathered = history.entry(key).or_default();
                    if let Some(records) = working.get(source) {
                        for record in records {
                            for property in properties {
                                if let Some(value) = record.fields.get(property) {
                                    if !value.is_null() && gathered.insert(value.to_string()) {
                                        values.push(value.clone());
                                    }
                                }
                            }
                        }
                    }
                }
                if !values.is_empty() {
                    groups.push(ColumnValues {
                        column: column.clone(),
                        values,
                    });
                }
            }
            if groups.is_empty() {
                continue;
            }

            let deleted = store.repository(target)?.delete_grouped(groups).await?;
            debug!(target = %target, rows = deleted.len(), "cascade delete pass");
            let structure = structures.get(target).await?;
            for record in deleted {
                let identity = record_key(&structure, &record);
                if known.insert((target.clone(), identity)) {
                    working.entry(target.clone()).or_default().push(record.clone());
                    folded.push(record);
                    progressed = true;
                }
            }
        }
        if !progressed {
            break;
        }
    }
    Ok(folded)
}

fn record_key(structure: &TableStructure, record: &EntityRecord) -> String {
    if structure.primary_keys.is_empty() {
        return serde_json::Value::Object(record.fields.clone()).to_string();
    }
    let mut parts = Vec::with_capacity(structure.primary_keys.len());
    for pk in &structure.primary_keys {
        match record.fields.get(pk) {
            Some(value) if !value.is_null() => parts.push(value.to_string()),
            _ => return serde_json::Value::Object(record.fields.clone()).to_string(),
        }
    }
    parts.join("/")
}
