//! Persistence layer: job queue, conversations, approvals and memory.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::InMemoryStore;
pub use traits::*;
