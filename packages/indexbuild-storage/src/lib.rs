//! Index catalog storage for the index build coordinator
//!
//! Owns everything that must outlive a process restart:
//!
//! 1. **Documents**: the data index builds scan
//! 2. **Pending builds**: temporary index storage allocated by in-flight builds
//! 3. **Catalog**: published indexes
//! 4. **Replication progress**: last durably-applied log position
//!
//! ## Usage
//!
//! ```rust,ignore
//! use indexbuild_storage::{IndexCatalogStore, MemoryCatalogStore};
//!
//! let store = MemoryCatalogStore::new();
//! store.insert_documents("test.coll", vec![json!({"a": 1})]).await?;
//!
//! // After a crash: drop whatever interrupted builds left behind
//! let cleaned = store.rollback_pending_builds().await?;
//! let resume_after = store.last_applied().await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    Document, IndexCatalogStore, IndexDescriptor, IndexStorageHandle, KeySpec, LogPosition,
    PendingBuild, PublishedIndex, RecordId,
};
pub use infrastructure::memory::MemoryCatalogStore;
#[cfg(feature = "sqlite")]
pub use infrastructure::sqlite::SqliteCatalogStore;
