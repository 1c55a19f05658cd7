//! Domain layer for the index catalog store
//!
//! # Domain Models
//!
//! - `KeySpec`: opaque key pattern of an index (`{"a": 1}`)
//! - `IndexDescriptor`: namespace + index name + key pattern
//! - `Document`: a stored record scanned by index builds
//! - `IndexStorageHandle`: temporary index storage owned by one build
//! - `PublishedIndex`: an index installed in the catalog
//! - `PendingBuild`: allocated storage that was never published or rolled back
//! - `LogPosition`: last durably-applied position of the replicated log
//!
//! # Port Trait
//!
//! - `IndexCatalogStore`: everything the build coordinator needs from storage
//!
//! # Examples
//!
//! ```rust,ignore
//! use indexbuild_storage::domain::{IndexCatalogStore, IndexDescriptor, KeySpec};
//!
//! async fn example(store: impl IndexCatalogStore) -> Result<()> {
//!     let descriptor = IndexDescriptor::new("test.coll", "myidx", KeySpec::from_json(json!({"a": 1})));
//!     let handle = store.allocate_index_storage(Uuid::new_v4(), descriptor).await?;
//!
//!     let docs = store.scan_documents("test.coll", None, 100).await?;
//!     store.write_index_entries(&handle, &docs).await?;
//!
//!     store.publish_index(&handle).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// Record identifier inside a namespace (monotonic, assigned on insert)
pub type RecordId = i64;

/// Key pattern of an index
///
/// The coordinator never looks inside a key spec; only storage uses it to
/// derive index keys from documents.
///
/// # Examples
///
/// ```rust
/// use indexbuild_storage::domain::KeySpec;
/// use serde_json::json;
///
/// let spec = KeySpec::from_json(json!({"a": 1}));
/// assert_eq!(spec.extract_key(&json!({"a": 7, "b": 2})), json!([7]));
/// ```
///
/// Field order is part of the pattern: `{"a": 1, "b": 1}` and
/// `{"b": 1, "a": 1}` are different key specs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySpec(serde_json::Value);

impl KeySpec {
    pub fn from_json(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_json(&self) -> &serde_json::Value {
        &self.0
    }

    /// Field names of the key pattern (empty if the pattern is not an object)
    pub fn fields(&self) -> Vec<&str> {
        match &self.0 {
            serde_json::Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Index key for a document: its values for each key field, missing fields as null
    pub fn extract_key(&self, document: &serde_json::Value) -> serde_json::Value {
        let key = self
            .fields()
            .into_iter()
            .map(|field| {
                document
                    .get(field)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null)
            })
            .collect();
        serde_json::Value::Array(key)
    }
}

impl PartialEq for KeySpec {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            // `Map` equality ignores insertion order.
            (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
            }
            (a, b) => a == b,
        }
    }
}

impl Eq for KeySpec {}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index identity plus key pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Owning collection (`db.collection`)
    pub namespace: String,
    /// Index name, unique per namespace once published
    pub name: String,
    /// Key pattern
    pub key_spec: KeySpec,
}

impl IndexDescriptor {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, key_spec: KeySpec) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            key_spec,
        }
    }
}

/// Stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: RecordId,
    pub body: serde_json::Value,
}

/// Temporary index storage owned exclusively by one build until publish or rollback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexStorageHandle {
    pub build_id: Uuid,
    pub descriptor: IndexDescriptor,
}

/// Index visible in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedIndex {
    pub descriptor: IndexDescriptor,
    /// Build that produced the index
    pub build_id: Uuid,
    pub entry_count: u64,
    pub published_at: DateTime<Utc>,
}

/// Storage allocated for a build that never reached publish or rollback
///
/// After a crash these are the leftovers of interrupted builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBuild {
    pub build_id: Uuid,
    pub descriptor: IndexDescriptor,
    pub entries_written: u64,
    pub allocated_at: DateTime<Utc>,
}

/// Position in the replicated log, ordered by (term, index)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogPosition {
    pub term: u64,
    pub index: u64,
}

impl LogPosition {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ term: {}, index: {} }}", self.term, self.index)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: IndexCatalogStore
// ═══════════════════════════════════════════════════════════════════════════

/// Storage and catalog operations consumed by index builds
///
/// # Core Operations
///
/// 1. **Documents**
///    - `insert_documents`: Append documents to a namespace
///    - `scan_documents`: Bounded scan in record order
///
/// 2. **Build storage**
///    - `allocate_index_storage`: Reserve temporary storage for a build
///    - `write_index_entries`: Add entries for a batch of documents
///    - `rollback_index_storage`: Drop everything a build wrote (idempotent)
///    - `publish_index`: Install the build's storage in the catalog
///
/// 3. **Catalog & recovery**
///    - `list_indexes` / `find_index`: Published indexes
///    - `list_pending_builds`: Allocations never published nor rolled back
///    - `last_applied` / `record_applied`: Durable replicated-log position
///
/// # Implementations
///
/// - `MemoryCatalogStore`: in-process, with fault injection for tests
/// - `SqliteCatalogStore`: file-backed, survives restarts
#[async_trait]
pub trait IndexCatalogStore: Send + Sync {
    // ═══════════════════════════════════════════════════════════════════════
    // Document Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Append documents, returning their record ids in insertion order
    async fn insert_documents(
        &self,
        namespace: &str,
        bodies: Vec<serde_json::Value>,
    ) -> Result<Vec<RecordId>>;

    /// Scan up to `limit` documents with record id strictly greater than `after`
    async fn scan_documents(
        &self,
        namespace: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Build Storage Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Allocate temporary index storage for a build
    ///
    /// # Errors
    ///
    /// Returns `ErrorKind::Allocation` if storage cannot be reserved.
    async fn allocate_index_storage(
        &self,
        build_id: Uuid,
        descriptor: IndexDescriptor,
    ) -> Result<IndexStorageHandle>;

    /// Write index entries for `documents`, returning the number written
    async fn write_index_entries(
        &self,
        handle: &IndexStorageHandle,
        documents: &[Document],
    ) -> Result<u64>;

    /// Remove every entry written for the build and release its storage
    ///
    /// Rolling back an unknown or already rolled back build is not an error.
    async fn rollback_index_storage(&self, handle: &IndexStorageHandle) -> Result<()>;

    /// Install the build's entries as a catalog index
    ///
    /// # Errors
    ///
    /// - `ErrorKind::BuildNotFound` if the storage was rolled back
    /// - `ErrorKind::IndexExists` if the name is already published
    async fn publish_index(&self, handle: &IndexStorageHandle) -> Result<PublishedIndex>;

    // ═══════════════════════════════════════════════════════════════════════
    // Catalog & Recovery Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Published indexes of a namespace, ordered by name
    async fn list_indexes(&self, namespace: &str) -> Result<Vec<PublishedIndex>>;

    /// Published index by name
    async fn find_index(&self, namespace: &str, name: &str) -> Result<Option<PublishedIndex>>;

    /// Allocations not yet published or rolled back
    async fn list_pending_builds(&self) -> Result<Vec<PendingBuild>>;

    /// Last durably-applied replicated log position
    async fn last_applied(&self) -> Result<Option<LogPosition>>;

    /// Durably record the last applied replicated log position
    async fn record_applied(&self, position: LogPosition) -> Result<()>;

    /// Roll back every pending build (startup cleanup after a crash)
    ///
    /// Returns the builds that were cleaned up.
    async fn rollback_pending_builds(&self) -> Result<Vec<PendingBuild>> {
        let pending = self.list_pending_builds().await?;
        for build in &pending {
            let handle = IndexStorageHandle {
                build_id: build.build_id,
                descriptor: build.descriptor.clone(),
            };
            self.rollback_index_storage(&handle).await?;
            debug!(
                build_id = %build.build_id,
                namespace = %build.descriptor.namespace,
                index_name = %build.descriptor.name,
                entries_written = build.entries_written,
                "rolled back pending index storage"
            );
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "pending index builds rolled back");
        }
        Ok(pending)
    }
}
