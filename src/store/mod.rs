//! Persistence layer: the `Persistence` trait and its backends.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
#[cfg(test)]
pub(crate) mod testing;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::Persistence;
