//! Cascade Module - graph traversal, flush protocol, and cascade delete

pub mod manager;

mod delete;


pub use manager::{EntityManager, FlushOptions};
