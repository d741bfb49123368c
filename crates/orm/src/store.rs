//! Storage collaborator interfaces
//!
//! The graph engine never executes SQL itself. Statement execution, table
//! structure, and transaction control live behind these traits and are
//! awaited only at committed points inside the flush protocol.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::entity::EntityId;
use crate::error::OrmResult;
use crate::session::Session;

/// Target of a foreign key column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyTarget {
    /// The referenced entity class
    pub class: String,
    /// The referenced column
    pub column: String,
}

/// Structural facts about one entity class's table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableStructure {
    pub primary_keys: Vec<String>,
    /// column -> referenced class/column
    pub foreign_keys: HashMap<String, ForeignKeyTarget>,
    pub not_null: HashSet<String>,
}

impl TableStructure {
    pub fn new(primary_keys: Vec<String>) -> Self {
        Self {
            primary_keys,
            foreign_keys: HashMap::new(),
            not_null: HashSet::new(),
        }
    }

    pub fn with_foreign_key(mut self, column: &str, class: &str, target_column: &str) -> Self {
        self.foreign_keys.insert(
            column.to_string(),
            ForeignKeyTarget {
                class: class.to_string(),
                column: target_column.to_string(),
            },
        );
        self
    }

    pub fn with_not_null(mut self, column: &str) -> Self {
        self.not_null.insert(column.to_string());
        self
    }
}

/// One entity's field values crossing the storage boundary
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// The session entity behind the record, when known
    pub entity: Option<EntityId>,
    pub class: String,
    pub fields: Map<String, Value>,
}

/// Values gathered for one column of a grouped delete
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnValues {
    pub column: String,
    pub values: Vec<Value>,
}

/// Per-class storage operations
#[async_trait]
pub trait Repository: Send + Sync {
    /// Primary key, foreign key, and nullability facts for the class
    async fn structure(&self) -> OrmResult<TableStructure>;

    /// Insert records, returning them synchronized (e.g. assigned keys)
    async fn insert(&self, records: Vec<EntityRecord>) -> OrmResult<Vec<EntityRecord>>;

    /// Update records, returning them synchronized
    async fn update(&self, records: Vec<EntityRecord>) -> OrmResult<Vec<EntityRecord>>;

    /// Delete records, returning the deleted rows
    async fn delete(&self, records: Vec<EntityRecord>) -> OrmResult<Vec<EntityRecord>>;

    /// Delete every row whose column matches one of the gathered values,
    /// returning the deleted rows
    async fn delete_grouped(&self, groups: Vec<ColumnValues>) -> OrmResult<Vec<EntityRecord>>;
}

/// Repository lookup per entity class
pub trait EntityStore: Send + Sync {
    fn repository(&self, class: &str) -> OrmResult<Arc<dyn Repository>>;
}

/// The ambient transaction handle used by the flush protocol
#[async_trait]
pub trait SessionContext: Send + Sync {
    /// Open a transaction if none is active; returns true when this call
    /// opened it
    async fn begin_transaction(&self) -> OrmResult<bool>;

    /// Defer constraint checking for the rest of the transaction
    async fn set_deferred_constraints(&self) -> OrmResult<()>;

    async fn commit(&self) -> OrmResult<()>;

    async fn rollback(&self) -> OrmResult<()>;
}

/// Entity materialization interface exposed to the storage layer
pub trait EntityFactory {
    /// Materialize a stored row into a session entity, reusing the identity
    /// map; the entity comes back relation-initialized and synced
    fn create_entity(
        &self,
        session: &mut Session,
        class: &str,
        values: Map<String, Value>,
    ) -> OrmResult<EntityId>;

    /// Identity-map lookup by primary key values
    fn entity_ref(
        &self,
        session: &Session,
        class: &str,
        values: &Map<String, Value>,
    ) -> Option<EntityId>;
}
