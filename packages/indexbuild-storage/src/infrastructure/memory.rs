//! In-memory catalog store
//!
//! Clones share state, so a clone kept across a simulated restart behaves
//! like durable storage. Fault injection hooks let tests drive allocation and
//! write failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    Document, IndexCatalogStore, IndexDescriptor, IndexStorageHandle, LogPosition, PendingBuild,
    PublishedIndex, RecordId,
};
use crate::error::{Result, StorageError};

struct PendingState {
    descriptor: IndexDescriptor,
    entries: Vec<(serde_json::Value, RecordId)>,
    allocated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Faults {
    fail_allocations: u32,
    /// Remaining successful write calls before writes start failing
    writes_before_failure: Option<u64>,
    scan_delay: Option<Duration>,
}

#[derive(Default)]
struct MemoryState {
    next_record_id: RecordId,
    documents: HashMap<String, BTreeMap<RecordId, serde_json::Value>>,
    pending: HashMap<Uuid, PendingState>,
    published: BTreeMap<(String, String), PublishedIndex>,
    last_applied: Option<LogPosition>,
    faults: Faults,
}

/// In-memory `IndexCatalogStore`
#[derive(Clone, Default)]
pub struct MemoryCatalogStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` allocations fail
    pub fn fail_next_allocations(&self, count: u32) {
        self.state.lock().faults.fail_allocations = count;
    }

    /// Let `successful` write calls through, then fail every write
    pub fn fail_writes_after(&self, successful: u64) {
        self.state.lock().faults.writes_before_failure = Some(successful);
    }

    /// Sleep before every scan (keeps builds in `Scanning` long enough to interrupt)
    pub fn set_scan_delay(&self, delay: Duration) {
        self.state.lock().faults.scan_delay = Some(delay);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults = Faults::default();
    }

    /// Number of allocations not yet published or rolled back
    pub fn open_allocations(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[async_trait]
impl IndexCatalogStore for MemoryCatalogStore {
    async fn insert_documents(
        &self,
        namespace: &str,
        bodies: Vec<serde_json::Value>,
    ) -> Result<Vec<RecordId>> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            state.next_record_id += 1;
            let id = state.next_record_id;
            state
                .documents
                .entry(namespace.to_string())
                .or_default()
                .insert(id, body);
            ids.push(id);
        }
        Ok(ids)
    }

    async fn scan_documents(
        &self,
        namespace: &str,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let delay = self.state.lock().faults.scan_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        let Some(docs) = state.documents.get(namespace) else {
            return Ok(Vec::new());
        };
        let start = after.map_or(RecordId::MIN, |id| id.saturating_add(1));
        Ok(docs
            .range(start..)
            .take(limit)
            .map(|(id, body)| Document {
                id: *id,
                body: body.clone(),
            })
            .collect())
    }

    async fn allocate_index_storage(
        &self,
        build_id: Uuid,
        descriptor: IndexDescriptor,
    ) -> Result<IndexStorageHandle> {
        let mut state = self.state.lock();
        if state.faults.fail_allocations > 0 {
            state.faults.fail_allocations -= 1;
            return Err(StorageError::allocation(format!(
                "Injected allocation failure for {} on {}",
                descriptor.name, descriptor.namespace
            )));
        }

        state.pending.insert(
            build_id,
            PendingState {
                descriptor: descriptor.clone(),
                entries: Vec::new(),
                allocated_at: Utc::now(),
            },
        );
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
        let mut state = self.state.lock();
        if let Some(remaining) = state.faults.writes_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(StorageError::write(format!(
                    "Injected write failure for build {}",
                    handle.build_id
                )));
            }
            *remaining -= 1;
        }

        let pending = state
            .pending
            .get_mut(&handle.build_id)
            .ok_or_else(|| StorageError::build_not_found(handle.build_id))?;
        for doc in documents {
            let key = pending.descriptor.key_spec.extract_key(&doc.body);
            pending.entries.push((key, doc.id));
        }
        Ok(documents.len() as u64)
    }

    async fn rollback_index_storage(&self, handle: &IndexStorageHandle) -> Result<()> {
        self.state.lock().pending.remove(&handle.build_id);
        Ok(())
    }

    async fn publish_index(&self, handle: &IndexStorageHandle) -> Result<PublishedIndex> {
        let mut state = self.state.lock();
        let key = (
            handle.descriptor.namespace.clone(),
            handle.descriptor.name.clone(),
        );
        if state.published.contains_key(&key) {
            return Err(StorageError::index_exists(&key.0, &key.1));
        }

        let pending = state
            .pending
            .remove(&handle.build_id)
            .ok_or_else(|| StorageError::build_not_found(handle.build_id))?;
        let index = PublishedIndex {
            descriptor: pending.descriptor,
            build_id: handle.build_id,
            entry_count: pending.entries.len() as u64,
            published_at: Utc::now(),
        };
        state.published.insert(key, index.clone());
        Ok(index)
    }

    async fn list_indexes(&self, namespace: &str) -> Result<Vec<PublishedIndex>> {
        Ok(self
            .state
            .lock()
            .published
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, index)| index.clone())
            .collect())
    }

    async fn find_index(&self, namespace: &str, name: &str) -> Result<Option<PublishedIndex>> {
        Ok(self
            .state
            .lock()
            .published
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn list_pending_builds(&self) -> Result<Vec<PendingBuild>> {
        let state = self.state.lock();
        let mut pending: Vec<_> = state
            .pending
            .iter()
            .map(|(build_id, p)| PendingBuild {
                build_id: *build_id,
                descriptor: p.descriptor.clone(),
                entries_written: p.entries.len() as u64,
                allocated_at: p.allocated_at,
            })
            .collect();
        pending.sort_by_key(|p| p.allocated_at);
        Ok(pending)
    }

    async fn last_applied(&self) -> Result<Option<LogPosition>> {
        Ok(self.state.lock().last_applied)
    }

    async fn record_applied(&self, position: LogPosition) -> Result<()> {
        self.state.lock().last_applied = Some(position);
        Ok(())
    }
}
