//! PostgreSQL session context
//!
//! Backs the flush protocol's transaction lifecycle with a real connection
//! pool. Deferred constraint checking maps to `SET CONSTRAINTS ALL DEFERRED`,
//! which is why write order across class groups cannot trip foreign keys
//! before commit.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{OrmError, OrmResult};
use crate::store::SessionContext;

/// PostgreSQL transaction lifecycle error types
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to begin transaction: {0}")]
    Begin(String),

    #[error("Failed to defer constraint checking: {0}")]
    DeferConstraints(String),

    #[error("Failed to commit transaction: {0}")]
    Commit(String),

    #[error("Failed to roll back transaction: {0}")]
    Rollback(String),

    #[error("No active transaction")]
    NoActiveTransaction,
}

impl From<BackendError> for OrmError {
    fn from(err: BackendError) -> Self {
        OrmError::Transaction(err.to_string())
    }
}

/// [`SessionContext`] implementation over a PostgreSQL pool
pub struct PostgresSessionContext {
    pool: PgPool,
    active: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PostgresSessionContext {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            active: Mutex::new(None),
        }
    }

    /// Whether a transaction is currently open
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

#[async_trait]
impl SessionContext for PostgresSessionContext {
    async fn begin_transaction(&self) -> OrmResult<bool> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Ok(false);
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BackendError::Begin(e.to_string()))?;
        *active = Some(tx);
        debug!("transaction started");
        Ok(true)
    }

    async fn set_deferred_constraints(&self) -> OrmResult<()> {
        let mut active = self.active.lock().await;
        let tx = active.as_mut().ok_or(BackendError::NoActiveTransaction)?;
        sqlx::query("SET CONSTRAINTS ALL DEFERRED")
            .execute(&mut **tx)
            .await
            .map_err(|e| BackendError::DeferConstraints(e.to_string()))?;
        debug!("constraint checking deferred");
        Ok(())
    }

    async fn commit(&self) -> OrmResult<()> {
        let tx = self
            .active
            .lock()
            .await
            .take()
            .ok_or(BackendError::NoActiveTransaction)?;
        tx.commit()
            .await
            .map_err(|e| BackendError::Commit(e.to_string()))?;
        debug!("transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> OrmResult<()> {
        let tx = self
            .active
            .lock()
            .await
            .take()
            .ok_or(BackendError::NoActiveTransaction)?;
        tx.rollback()
            .await
            .map_err(|e| BackendError::Rollback(e.to_string()))?;
        debug!("transaction rolled back");
        Ok(())
    }
}
