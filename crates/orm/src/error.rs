//! Error types for the relation graph and entity lifecycle engine
//!
//! Every error carries the class/property/relation context needed to locate
//! the offending declaration or call site. Errors propagate uncaught; the
//! engine never retries or repairs a bad configuration.

use std::fmt;

use crate::entity::EntityId;

/// Result type alias for ORM operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Error types for relation and persistence operations
#[derive(Debug, Clone)]
pub enum OrmError {
    /// Malformed or contradictory relation/cascade declaration
    Configuration(String),
    /// A related-entity argument does not match the relation's declared class
    TypeMismatch {
        class: String,
        property: String,
        expected: String,
        found: String,
    },
    /// An alias or relation name does not resolve for the given class
    RelationNotFound { class: String, relation: String },
    /// A mid-relation operation on a manyToMany relation without junction configuration
    MidRelationUndefined { class: String, relation: String },
    /// The junction factory failed or returned a value of the wrong type
    FactoryCallback {
        class: String,
        relation: String,
        cause: String,
    },
    /// A persistence-layer invariant cannot be honored (e.g. composite primary keys)
    PersistenceIntegrity(String),
    /// An entity id does not resolve in the owning session
    UnknownEntity(EntityId),
    /// Storage layer error
    Database(String),
    /// Transaction lifecycle error
    Transaction(String),
    /// Serialization/deserialization error
    Serialization(String),
}

impl fmt::Display for OrmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrmError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OrmError::TypeMismatch {
                class,
                property,
                expected,
                found,
            } => write!(
                f,
                "Type mismatch on '{}::{}': expected '{}', found '{}'",
                class, property, expected, found
            ),
            OrmError::RelationNotFound { class, relation } => {
                write!(f, "Relation '{}' not found on class '{}'", relation, class)
            }
            OrmError::MidRelationUndefined { class, relation } => write!(
                f,
                "Mid relation not defined for relation '{}' on class '{}'",
                relation, class
            ),
            OrmError::FactoryCallback {
                class,
                relation,
                cause,
            } => write!(
                f,
                "Junction factory failed for relation '{}' on class '{}': {}",
                relation, class, cause
            ),
            OrmError::PersistenceIntegrity(msg) => {
                write!(f, "Persistence integrity error: {}", msg)
            }
            OrmError::UnknownEntity(id) => {
                write!(f, "Entity {} is not owned by this session", id)
            }
            OrmError::Database(msg) => write!(f, "Database error: {}", msg),
            OrmError::Transaction(msg) => write!(f, "Transaction error: {}", msg),
            OrmError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for OrmError {}

// Convert from sqlx errors
impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        OrmError::Database(err.to_string())
    }
}

// Convert from serde_json errors
impl From<serde_json::Error> for OrmError {
    fn from(err: serde_json::Error) -> Self {
        OrmError::Serialization(err.to_string())
    }
}

// Convert from anyhow errors
impl From<anyhow::Error> for OrmError {
    fn from(err: anyhow::Error) -> Self {
        OrmError::Database(err.to_string())
    }
}
