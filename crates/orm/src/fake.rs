//! In-memory storage doubles
//!
//! A table-per-class store and a call-recording session context, used by the
//! cascade tests and by applications that want to exercise persistence logic
//! without a database.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::error::{OrmError, OrmResult};
use crate::store::{
    ColumnValues, EntityRecord, EntityStore, Repository, SessionContext, TableStructure,
};

struct MemoryTable {
    structure: TableStructure,
    rows: Mutex<Vec<Map<String, Value>>>,
    next_key: AtomicI64,
}

/// In-memory [`EntityStore`] with one table per entity class
#[derive(Default)]
pub struct MemoryStore {
    tables: DashMap<String, Arc<MemoryTable>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the table backing an entity class
    pub fn define(&self, class: &str, structure: TableStructure) {
        self.tables.insert(
            class.to_string(),
            Arc::new(MemoryTable {
                structure,
                rows: Mutex::new(Vec::new()),
                next_key: AtomicI64::new(1),
            }),
        );
    }

    /// The current rows of a class's table
    pub fn rows(&self, class: &str) -> Vec<Map<String, Value>> {
        self.tables
            .get(class)
            .map(|table| table.rows.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

impl EntityStore for MemoryStore {
    fn repository(&self, class: &str) -> OrmResult<Arc<dyn Repository>> {
        let table = self
            .tables
            .get(class)
            .map(|entry| entry.clone())
            .ok_or_else(|| OrmError::Database(format!("no table defined for class '{}'", class)))?;
        Ok(Arc::new(MemoryRepository {
            class: class.to_string(),
            table,
        }))
    }
}

struct MemoryRepository {
    class: String,
    table: Arc<MemoryTable>,
}

impl MemoryRepository {
    fn pk_matches(&self, row: &Map<String, Value>, fields: &Map<String, Value>) -> bool {
        self.table
            .structure
            .primary_keys
            .iter()
            .all(|pk| row.get(pk).filter(|v| !v.is_null()) == fields.get(pk).filter(|v| !v.is_null()))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn structure(&self) -> OrmResult<TableStructure> {
        Ok(self.table.structure.clone())
    }

    async fn insert(&self, records: Vec<EntityRecord>) -> OrmResult<Vec<EntityRecord>> {
        let mut rows = self.table.rows.lock().unwrap();
        let mut synced = Vec::with_capacity(records.len());
        for mut record in records {
            // a single-column primary key is assigned when missing or still
            // holding a placeholder
            if let [pk] = &self.table.structure.primary_keys[..] {
                let needs_key = match record.fields.get(pk) {
                    None | Some(Value::Null) => true,
                    Some(value) => value.as_i64().map_or(false, |v| v < 0),
                };
                if needs_key {
                    let key = self.table.next_key.fetch_add(1, Ordering::SeqCst);
                    record.fields.insert(pk.clone(), Value::from(key));
                }
            }
            rows.push(record.fields.clone());
            synced.push(record);
        }
        Ok(synced)
    }

    async fn update(&self, records: Vec<EntityRecord>) -> OrmResult<Vec<EntityRecord>> {
        let mut rows = self.table.rows.lock().unwrap();
        for record in &records {
            let row = rows
                .iter_mut()
                .find(|row| self.pk_matches(row, &record.fields))
                .ok_or_else(|| {
                    OrmError::Database(format!("no stored row matches an update of '{}'", self.class))
                })?;
            *row = record.fields.clone();
        }
        Ok(records)
    }

    async fn delete(&self, records: Vec<EntityRecord>) -> OrmResult<Vec<EntityRecord>> {
        let mut rows = self.table.rows.lock().unwrap();
        let mut deleted = Vec::new();
        for record in &records {
            rows.retain(|row| {
                if self.pk_matches(row, &record.fields) {
                    deleted.push(EntityRecord {
                        entity: record.entity,
                        class: self.class.clone(),
                        fields: row.clone(),
                    });
                    false
                } else {
                    true
                }
            });
        }
        Ok(deleted)
    }

    async fn delete_grouped(&self, groups: Vec<ColumnValues>) -> OrmResult<Vec<EntityRecord>> {
        let mut rows = self.table.rows.lock().unwrap();
        let mut deleted = Vec::new();
        rows.retain(|row| {
            let hit = groups.iter().any(|group| {
                row.get(&group.column)
                    .map_or(false, |value| group.values.contains(value))
            });
            if hit {
                deleted.push(EntityRecord {
                    entity: None,
                    class: self.class.clone(),
                    fields: row.clone(),
                });
            }
            !hit
        });
        Ok(deleted)
    }
}

/// [`SessionContext`] double recording the transaction lifecycle calls
#[derive(Debug, Default)]
pub struct RecordingContext {
    calls: Mutex<Vec<String>>,
    active: Mutex<bool>,
}

impl RecordingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lifecycle calls seen so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionContext for RecordingContext {
    async fn begin_transaction(&self) -> OrmResult<bool> {
        let mut active = self.active.lock().unwrap();
        if *active {
            return Ok(false);
        }
        *active = true;
        self.calls.lock().unwrap().push("begin".to_string());
        Ok(true)
    }

    async fn set_deferred_constraints(&self) -> OrmResult<()> {
        self.calls.lock().unwrap().push("defer".to_string());
        Ok(())
    }

    async fn commit(&self) -> OrmResult<()> {
        let mut active = self.active.lock().unwrap();
        if !*active {
            return Err(OrmError::Transaction("no active transaction".to_string()));
        }
        *active = false;
        self.calls.lock().unwrap().push("commit".to_string());
        Ok(())
    }

    async fn rollback(&self) -> OrmResult<()> {
        let mut active = self.active.lock().unwrap();
        if !*active {
            return Err(OrmError::Transaction("no active transaction".to_string()));
        }
        *active = false;
        self.calls.lock().unwrap().push("rollback".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(class: &str, pairs: &[(&str, Value)]) -> EntityRecord {
        EntityRecord {
            entity: None,
            class: class.to_string(),
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_single_column_keys() {
        let store = MemoryStore::new();
        store.define("User", TableStructure::new(vec!["id".to_string()]));
        let repository = store.repository("User").unwrap();

        let synced = repository
            .insert(vec![
                record("User", &[("name", json!("Ada"))]),
                record("User", &[("id", json!(-3)), ("name", json!("Grace"))]),
            ])
            .await
            .unwrap();

        assert_eq!(synced[0].fields["id"], json!(1));
        assert_eq!(synced[1].fields["id"], json!(2));
        assert_eq!(store.rows("User").len(), 2);
    }

    #[tokio::test]
    async fn test_delete_grouped_matches_any_group() {
        let store = MemoryStore::new();
        store.define("User", TableStructure::new(vec!["id".to_string()]));
        let repository = store.repository("User").unwrap();
        repository
            .insert(vec![
                record("User", &[("id", json!(1)), ("team", json!(10))]),
                record("User", &[("id", json!(2)), ("team", json!(20))]),
                record("User", &[("id", json!(3)), ("team", json!(30))]),
            ])
            .await
            .unwrap();

        let deleted = repository
            .delete_grouped(vec![ColumnValues {
                column: "team".to_string(),
                values: vec![json!(10), json!(30)],
            }])
            .await
            .unwrap();

        assert_eq!(deleted.len(), 2);
        assert_eq!(store.rows("User").len(), 1);
    }

    #[tokio::test]
    async fn test_recording_context_tracks_nesting() {
        let context = RecordingContext::new();
        assert!(context.begin_transaction().await.unwrap());
        assert!(!context.begin_transaction().await.unwrap());
        context.set_deferred_constraints().await.unwrap();
        context.commit().await.unwrap();
        assert!(context.commit().await.is_err());
        assert_eq!(context.calls(), vec!["begin", "defer", "commit"]);
    }
}
