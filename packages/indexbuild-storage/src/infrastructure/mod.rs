//! Infrastructure layer - Storage adapters
//!
//! - `memory`: in-process store with fault injection
//! - `sqlite`: file-backed store

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryCatalogStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteCatalogStore;
