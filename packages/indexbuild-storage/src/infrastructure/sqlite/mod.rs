//! SQLite catalog store
//!
//! File-backed persistent storage. Publishing and rollback each run in one
//! transaction, so a crash leaves a build either fully pending or fully
//! published; pending builds are found again by `list_pending_builds` on the
//! next start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    Document, IndexCatalogStore, IndexDescriptor, IndexStorageHandle, KeySpec, LogPosition,
    PendingBuild, PublishedIndex, RecordId,
};
use crate::error::{Result, StorageError};

/// SQLite-based `IndexCatalogStore`
#[derive(Clone)]
pub struct SqliteCatalogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalogStore {
    /// Open (or create) a store at the given path
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        debug!(path = %db_path.display(), "opening SQLite catalog");
        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;

             CREATE TABLE IF NOT EXISTS documents (
                record_id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                body TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_documents_namespace
             ON documents(namespace, record_id);

             CREATE TABLE IF NOT EXISTS pending_builds (
                build_id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                key_spec TEXT NOT NULL,
                allocated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS index_entries (
                build_id TEXT NOT NULL,
                index_key TEXT NOT NULL,
                record_id INTEGER NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_index_entries_build
             ON index_entries(build_id);

             CREATE TABLE IF NOT EXISTS catalog_indexes (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                key_spec TEXT NOT NULL,
                build_id TEXT NOT NULL,
                entry_count INTEGER NOT NULL,
                published_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
             );

             CREATE TABLE IF NOT EXISTS replication_progress (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                term INTEGER NOT NULL,
                log_index INTEGER NOT NULL
             );",
        )?;

        Ok(())
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| StorageError::serialization(format!("Invalid build id {}: {}", raw, e)))
}

fn timestamp(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Raw catalog row: (namespace, name, key_spec, build_id, entry_count, published_at)
type CatalogRow = (String, String, String, String, i64, i64);

fn catalog_row(row: &Row<'_>) -> rusqlite::Result<CatalogRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn published_from_row(row: CatalogRow) -> Result<PublishedIndex> {
    let (namespace, name, key_spec, build_id, entry_count, published_at) = row;
    Ok(PublishedIndex {
        descriptor: IndexDescriptor::new(
            namespace,
            name,
            KeySpec::from_json(serde_json::from_str(&key_spec)?),
        ),
        build_id: parse_uuid(&build_id)?,
        entry_count: entry_count as u64,
        published_at: timestamp(published_at),
    })
}

#[async_trait]
impl IndexCatalogStore for SqliteCatalogStore {
    async fn insert_documents(
        &self,
        namespace: &str,
        bodies: Vec<serde_json::Value>,
    ) -> Result<Vec<RecordId>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            tx.execute(
                "INSERT INTO documents (namespace, body) VALUES (?1, ?2)",
                params![namespace, serde_json::to_string(&body)?],
            )?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    async fn scan_documents(
        &self,
        namespace: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT record_id, body FROM documents
             WHERE namespace = ?1 AND record_id > ?2
             ORDER BY record_id
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![namespace, after.unwrap_or(0), limit as i64],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, body)| -> Result<Document> {
                Ok(Document {
                    id,
                    body: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }

    async fn allocate_index_storage(
        &self,
        build_id: Uuid,
        descriptor: IndexDescriptor,
    ) -> Result<IndexStorageHandle> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO pending_builds (build_id, namespace, name, key_spec, allocated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                build_id.to_string(),
                &descriptor.namespace,
                &descriptor.name,
                serde_json::to_string(descriptor.key_spec.as_json())?,
                Utc::now().timestamp_millis()
            ],
        )
        .map_err(|e| {
            warn!(%build_id, error = %e, "index storage allocation failed");
            StorageError::allocation(format!(
                "Cannot allocate storage for {} on {}",
                descriptor.name, descriptor.namespace
            ))
            .with_source(e)
        })?;
        Ok(IndexStorageHandle {
            build_id,
            descriptor,
        })
    }

    async fn write_index_entries(
        &self,
        handle: &IndexStorageHandle,
        documents: &[Document],
    ) -> Result<u64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let build_id = handle.build_id.to_string();

        let allocated: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM pending_builds WHERE build_id = ?1",
                params![&build_id],
                |row| row.get(0),
            )
            .optional()?;
        if allocated.is_none() {
            return Err(StorageError::build_not_found(handle.build_id));
        }

        for doc in documents {
            let key = handle.descriptor.key_spec.extract_key(&doc.body);
            tx.execute(
                "INSERT INTO index_entries (build_id, index_key, record_id) VALUES (?1, ?2, ?3)",
                params![&build_id, serde_json::to_string(&key)?, doc.id],
            )?;
        }
        tx.commit()?;
        Ok(documents.len() as u64)
    }

    async fn rollback_index_storage(&self, handle: &IndexStorageHandle) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let build_id = handle.build_id.to_string();

        let published: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM catalog_indexes WHERE build_id = ?1",
                params![&build_id],
                |row| row.get(0),
            )
            .optional()?;
        if published.is_none() {
            tx.execute(
                "DELETE FROM index_entries WHERE build_id = ?1",
                params![&build_id],
            )?;
        }
        tx.execute(
            "DELETE FROM pending_builds WHERE build_id = ?1",
            params![&build_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn publish_index(&self, handle: &IndexStorageHandle) -> Result<PublishedIndex> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let build_id = handle.build_id.to_string();
        let descriptor = &handle.descriptor;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM catalog_indexes WHERE namespace = ?1 AND name = ?2",
                params![&descriptor.namespace, &descriptor.name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(StorageError::index_exists(
                &descriptor.namespace,
                &descriptor.name,
            ));
        }

        let removed = tx.execute(
            "DELETE FROM pending_builds WHERE build_id = ?1",
            params![&build_id],
        )?;
        if removed == 0 {
            return Err(StorageError::build_not_found(handle.build_id));
        }

        let entry_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM index_entries WHERE build_id = ?1",
            params![&build_id],
            |row| row.get(0),
        )?;
        let published_at = Utc::now();
        tx.execute(
            "INSERT INTO catalog_indexes (namespace, name, key_spec, build_id, entry_count, published_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &descriptor.namespace,
                &descriptor.name,
                serde_json::to_string(descriptor.key_spec.as_json())?,
                &build_id,
                entry_count,
                published_at.timestamp_millis()
            ],
        )?;
        tx.commit()?;

        Ok(PublishedIndex {
            descriptor: descriptor.clone(),
            build_id: handle.build_id,
            entry_count: entry_count as u64,
            published_at,
        })
    }

    async fn list_indexes(&self, namespace: &str) -> Result<Vec<PublishedIndex>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT namespace, name, key_spec, build_id, entry_count, published_at
             FROM catalog_indexes WHERE namespace = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![namespace], catalog_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(published_from_row).collect()
    }

    async fn find_index(&self, namespace: &str, name: &str) -> Result<Option<PublishedIndex>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT namespace, name, key_spec, build_id, entry_count, published_at
                 FROM catalog_indexes WHERE namespace = ?1 AND name = ?2",
                params![namespace, name],
                catalog_row,
            )
            .optional()?;
        row.map(published_from_row).transpose()
    }

    async fn list_pending_builds(&self) -> Result<Vec<PendingBuild>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT p.build_id, p.namespace, p.name, p.key_spec, p.allocated_at,
                    (SELECT COUNT(*) FROM index_entries e WHERE e.build_id = p.build_id)
             FROM pending_builds p ORDER BY p.allocated_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(
                |(build_id, namespace, name, key_spec, allocated_at, entries)| -> Result<PendingBuild> {
                    Ok(PendingBuild {
                        build_id: parse_uuid(&build_id)?,
                        descriptor: IndexDescriptor::new(
                            namespace,
                            name,
                            KeySpec::from_json(serde_json::from_str(&key_spec)?),
                        ),
                        entries_written: entries as u64,
                        allocated_at: timestamp(allocated_at),
                    })
                },
            )
            .collect()
    }

    async fn last_applied(&self) -> Result<Option<LogPosition>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT term, log_index FROM replication_progress WHERE id = 0",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(term, index)| LogPosition::new(term as u64, index as u64)))
    }

    async fn record_applied(&self, position: LogPosition) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO replication_progress (id, term, log_index) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET term = excluded.term, log_index = excluded.log_index",
            params![position.term as i64, position.index as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn descriptor(name: &str, key: serde_json::Value) -> IndexDescriptor {
        IndexDescriptor::new("test.coll", name, KeySpec::from_json(key))
    }

    #[tokio::test]
    async fn test_scan_documents_pages_by_record_id() {
        let store = SqliteCatalogStore::in_memory().unwrap();
        let ids = store
            .insert_documents("test.coll", vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})])
            .await
            .unwrap();
        store
            .insert_documents("other.coll", vec![json!({"a": 9})])
            .await
            .unwrap();

        let first = store.scan_documents("test.coll", None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, ids[0]);

        let rest = store
            .scan_documents("test.coll", Some(first[1].id), 10)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].body, json!({"a": 3}));
    }

    #[tokio::test]
    async fn test_publish_and_find() {
        let store = SqliteCatalogStore::in_memory().unwrap();
        store
            .insert_documents("test.coll", vec![json!({"b": 1}), json!({"b": 2})])
            .await
            .unwrap();

        let handle = store
            .allocate_index_storage(Uuid::new_v4(), descriptor("myidx", json!({"b": 1})))
            .await
            .unwrap();
        let docs = store.scan_documents("test.coll", None, 10).await.unwrap();
        store.write_index_entries(&handle, &docs).await.unwrap();

        let published = store.publish_index(&handle).await.unwrap();
        assert_eq!(published.entry_count, 2);

        let found = store.find_index("test.coll", "myidx").await.unwrap().unwrap();
        assert_eq!(found.descriptor.key_spec.as_json(), &json!({"b": 1}));
        assert_eq!(found.build_id, handle.build_id);
        assert!(store.list_pending_builds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_removes_entries_and_is_idempotent() {
        let store = SqliteCatalogStore::in_memory().unwrap();
        store
            .insert_documents("test.coll", vec![json!({"a": 1})])
            .await
            .unwrap();
        let handle = store
            .allocate_index_storage(Uuid::new_v4(), descriptor("myidx", json!({"a": 1})))
            .await
            .unwrap();
        let docs = store.scan_documents("test.coll", None, 10).await.unwrap();
        store.write_index_entries(&handle, &docs).await.unwrap();

        store.rollback_index_storage(&handle).await.unwrap();
        store.rollback_index_storage(&handle).await.unwrap();

        assert!(store.list_pending_builds().await.unwrap().is_empty());
        let err = store.write_index_entries(&handle, &docs).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BuildNotFound);
    }

    #[tokio::test]
    async fn test_pending_builds_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        let build_id = Uuid::new_v4();
        {
            let store = SqliteCatalogStore::open(&path).unwrap();
            store
                .insert_documents("test.coll", vec![json!({"a": 1})])
                .await
                .unwrap();
            let handle = store
                .allocate_index_storage(build_id, descriptor("myidx", json!({"a": 1})))
                .await
                .unwrap();
            let docs = store.scan_documents("test.coll", None, 10).await.unwrap();
            store.write_index_entries(&handle, &docs).await.unwrap();
            store.record_applied(LogPosition::new(1, 4)).await.unwrap();
        }

        let reopened = SqliteCatalogStore::open(&path).unwrap();
        let pending = reopened.list_pending_builds().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].build_id, build_id);
        assert_eq!(pending[0].entries_written, 1);
        assert_eq!(
            reopened.last_applied().await.unwrap(),
            Some(LogPosition::new(1, 4))
        );

        let cleaned = reopened.rollback_pending_builds().await.unwrap();
        assert_eq!(cleaned.len(), 1);
        assert!(reopened.list_pending_builds().await.unwrap().is_empty());
        assert!(reopened.list_indexes("test.coll").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_duplicate_name_rejected() {
        let store = SqliteCatalogStore::in_memory().unwrap();
        let first = store
            .allocate_index_storage(Uuid::new_v4(), descriptor("myidx", json!({"a": 1})))
            .await
            .unwrap();
        store.publish_index(&first).await.unwrap();

        let second = store
            .allocate_index_storage(Uuid::new_v4(), descriptor("myidx", json!({"b": 1})))
            .await
            .unwrap();
        let err = store.publish_index(&second).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::IndexExists);

        // The losing build is still pending and can be rolled back
        assert_eq!(store.list_pending_builds().await.unwrap().len(), 1);
        store.rollback_index_storage(&second).await.unwrap();
        assert_eq!(store.list_indexes("test.coll").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_published_key_order_round_trips() {
        let store = SqliteCatalogStore::in_memory().unwrap();
        let handle = store
            .allocate_index_storage(Uuid::new_v4(), descriptor("ba_1", json!({"b": 1, "a": 1})))
            .await
            .unwrap();
        store.publish_index(&handle).await.unwrap();

        let found = store.find_index("test.coll", "ba_1").await.unwrap().unwrap();
        assert_eq!(found.descriptor.key_spec, KeySpec::from_json(json!({"b": 1, "a": 1})));
        assert_ne!(found.descriptor.key_spec, KeySpec::from_json(json!({"a": 1, "b": 1})));
    }

    #[tokio::test]
    async fn test_record_applied_overwrites() {
        let store = SqliteCatalogStore::in_memory().unwrap();
        store.record_applied(LogPosition::new(1, 1)).await.unwrap();
        store.record_applied(LogPosition::new(2, 5)).await.unwrap();
        assert_eq!(
            store.last_applied().await.unwrap(),
            Some(LogPosition::new(2, 5))
        );
    }
}
