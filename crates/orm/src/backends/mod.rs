//! Database Backend Implementations

pub mod postgres;

pub use postgres::{BackendError, PostgresSessionContext};
