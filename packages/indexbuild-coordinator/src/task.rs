//! Build Task
//!
//! One spawned task per registered build. It drives the build through
//!
//! ```text
//! allocate ──► [fail point] ──► scan chunks ──► commit fence ──► publish
//!                                   │                 │
//!                                   └── abort ◄───────┘ (cancelled)
//!                                         │
//!                                    rollback ──► Aborted ──► retire
//! ```
//!
//! Abort requests are observed only at chunk boundaries. Whatever path a
//! build takes, storage it allocated is either published or rolled back
//! before the entry is retired.

use crate::build::{BuildId, BuildState, IndexBuildEntry};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::events::{DiagnosticEvent, DiagnosticsSink};
use crate::failpoint::FailPoints;
use crate::registry::BuildRegistry;
use indexbuild_storage::{IndexCatalogStore, IndexStorageHandle, PublishedIndex, StorageError};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handles a build task needs, passed explicitly instead of through globals
#[derive(Clone)]
pub struct BuildContext {
    pub registry: Arc<BuildRegistry>,
    pub storage: Arc<dyn IndexCatalogStore>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
    pub fail_points: Arc<FailPoints>,
    pub config: Arc<CoordinatorConfig>,
    /// Cancelled when the node dies; tasks stop where they are, without cleanup
    pub process: CancellationToken,
}

/// Successful build result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub build_id: BuildId,
    pub namespace: String,
    pub index_name: String,
    pub entries_indexed: u64,
    pub published: PublishedIndex,
}

/// Requester side of a running build
#[derive(Debug)]
pub struct BuildHandle {
    build_id: BuildId,
    join: JoinHandle<Result<BuildOutcome>>,
}

impl BuildHandle {
    pub fn build_id(&self) -> BuildId {
        self.build_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the build to commit or fail
    pub async fn wait(self) -> Result<BuildOutcome> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(CoordinatorError::Terminated(self.build_id)),
            Err(e) => Err(CoordinatorError::internal(format!(
                "Index build task {} panicked: {}",
                self.build_id, e
            ))),
        }
    }
}

pub struct BuildTask {
    ctx: BuildContext,
    entry: IndexBuildEntry,
    cancel: CancellationToken,
}

impl BuildTask {
    /// Spawn the task for a registered build
    pub fn spawn(ctx: BuildContext, build_id: BuildId) -> Result<BuildHandle> {
        let entry = ctx
            .registry
            .get(build_id)
            .ok_or(CoordinatorError::BuildNotFound(build_id))?;
        let cancel = ctx.registry.cancellation_token(build_id)?;
        let process = ctx.process.clone();
        let task = BuildTask { ctx, entry, cancel };

        let join = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = process.cancelled() => {
                    debug!(%build_id, "index build task dropped by node termination");
                    Err(CoordinatorError::Terminated(build_id))
                }
                result = task.run() => result,
            }
        });
        Ok(BuildHandle { build_id, join })
    }

    async fn run(self) -> Result<BuildOutcome> {
        let build_id = self.entry.build_id;
        self.ctx.diagnostics.record(DiagnosticEvent::BuildStarted {
            build_id,
            namespace: self.entry.namespace.clone(),
            index_name: self.entry.index_name.clone(),
            key_spec: self.entry.key_spec.to_string(),
            origin_term: self.entry.origin_term,
        });

        let handle = match self
            .ctx
            .storage
            .allocate_index_storage(build_id.as_uuid(), self.entry.descriptor())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(%build_id, error = %e, "index build: storage allocation failed");
                // Nothing was allocated, so there is nothing to roll back.
                if self.cancel.is_cancelled() {
                    return self.interrupted();
                }
                self.ctx.registry.finish(build_id, BuildState::Aborted)?;
                self.record_aborted(&e.to_string());
                return Err(e.into());
            }
        };

        self.ctx
            .fail_points
            .hang_after_initializing_index_build
            .pause_while_enabled()
            .await;

        if self.cancel.is_cancelled() {
            return self.abort(&handle).await;
        }
        if let Err(e) = self.ctx.registry.transition(build_id, BuildState::Scanning) {
            if self.cancel.is_cancelled() {
                return self.abort(&handle).await;
            }
            return Err(e);
        }

        let entries_indexed = match self.scan(&handle).await {
            Ok(Some(count)) => count,
            Ok(None) => return self.abort(&handle).await,
            Err(e) => return self.fail(&handle, e).await,
        };

        if !self.ctx.registry.begin_commit(build_id)? {
            return self.abort(&handle).await;
        }

        let published = match self.ctx.storage.publish_index(&handle).await {
            Ok(published) => published,
            Err(e) => return self.fail(&handle, e).await,
        };
        self.ctx.registry.finish(build_id, BuildState::Committed)?;

        info!(
            %build_id,
            namespace = %self.entry.namespace,
            index_name = %self.entry.index_name,
            entries_indexed,
            "index build: committed"
        );
        self.ctx.diagnostics.record(DiagnosticEvent::BuildCommitted {
            build_id,
            namespace: self.entry.namespace.clone(),
            index_name: self.entry.index_name.clone(),
            entries_indexed,
        });

        Ok(BuildOutcome {
            build_id,
            namespace: self.entry.namespace.clone(),
            index_name: self.entry.index_name.clone(),
            entries_indexed,
            published,
        })
    }

    /// Scan the namespace chunk by chunk; `None` if cancelled at a chunk boundary
    async fn scan(&self, handle: &IndexStorageHandle) -> std::result::Result<Option<u64>, StorageError> {
        let chunk_size = self.ctx.config.scan_chunk_size;
        let yield_every = self.ctx.config.yield_every_chunks.max(1);
        let mut after = None;
        let mut indexed = 0u64;
        let mut chunks = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            let documents = self
                .ctx
                .storage
                .scan_documents(&self.entry.namespace, after, chunk_size)
                .await?;
            if documents.is_empty() {
                break;
            }
            after = documents.last().map(|d| d.id);
            indexed += self
                .ctx
                .storage
                .write_index_entries(handle, &documents)
                .await?;

            chunks = chunks.wrapping_add(1);
            if chunks % yield_every == 0 {
                tokio::task::yield_now().await;
            }
            if documents.len() < chunk_size {
                break;
            }
        }

        debug!(build_id = %self.entry.build_id, indexed, "index build: scan complete");
        Ok(Some(indexed))
    }

    /// Interrupt path: roll back, then `Aborted`
    async fn abort(&self, handle: &IndexStorageHandle) -> Result<BuildOutcome> {
        self.release(handle).await?;
        self.interrupted()
    }

    // Storage is already released; retire and report the interrupt.
    fn interrupted(&self) -> Result<BuildOutcome> {
        let build_id = self.entry.build_id;
        let reason = self
            .ctx
            .registry
            .get(build_id)
            .and_then(|e| e.abort_reason)
            .unwrap_or_else(|| "abort requested".to_string());

        self.ctx.registry.finish(build_id, BuildState::Aborted)?;
        self.record_aborted(&reason);

        Err(CoordinatorError::BuildAbortedByInterrupt {
            namespace: self.entry.namespace.clone(),
            index_name: self.entry.index_name.clone(),
            reason,
        })
    }

    /// Storage failure path: `Aborting`, roll back, then `Aborted`
    async fn fail(&self, handle: &IndexStorageHandle, cause: StorageError) -> Result<BuildOutcome> {
        let build_id = self.entry.build_id;
        warn!(%build_id, error = %cause, "index build: storage failure, aborting");

        if let Err(e) = self.ctx.registry.transition(build_id, BuildState::Aborting) {
            // An interrupt may have moved it already.
            debug!(%build_id, error = %e, "index build: already aborting");
        }
        self.release(handle).await?;
        self.ctx.registry.finish(build_id, BuildState::Aborted)?;
        self.record_aborted(&cause.to_string());

        Err(cause.into())
    }

    // On rollback failure the entry stays `Aborting`; startup recovery rolls
    // the pending storage back.
    async fn release(&self, handle: &IndexStorageHandle) -> Result<()> {
        if let Err(e) = self.ctx.storage.rollback_index_storage(handle).await {
            error!(
                build_id = %self.entry.build_id,
                error = %e,
                "index build: rollback failed, leaving build in aborting"
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn record_aborted(&self, reason: &str) {
        info!(
            build_id = %self.entry.build_id,
            namespace = %self.entry.namespace,
            index_name = %self.entry.index_name,
            reason,
            "Index build aborted"
        );
        self.ctx.diagnostics.record(DiagnosticEvent::BuildAborted {
            build_id: self.entry.build_id,
            namespace: self.entry.namespace.clone(),
            index_name: self.entry.index_name.clone(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildOrigin;
    use crate::events::RecordingDiagnostics;
    use indexbuild_storage::{KeySpec, MemoryCatalogStore};
    use serde_json::json;
    use std::time::Duration;

    fn context(store: MemoryCatalogStore, chunk: usize) -> (BuildContext, Arc<RecordingDiagnostics>) {
        let diagnostics = Arc::new(RecordingDiagnostics::new());
        let ctx = BuildContext {
            registry: Arc::new(BuildRegistry::default()),
            storage: Arc::new(store),
            diagnostics: diagnostics.clone(),
            fail_points: Arc::new(FailPoints::default()),
            config: Arc::new(CoordinatorConfig::default().with_scan_chunk_size(chunk)),
            process: CancellationToken::new(),
        };
        (ctx, diagnostics)
    }

    async fn seed(store: &MemoryCatalogStore, count: usize) {
        let docs = (0..count).map(|i| json!({"a": i, "b": i % 3})).collect();
        store.insert_documents("test.coll", docs).await.unwrap();
    }

    fn register(ctx: &BuildContext, name: &str, field: &str) -> BuildId {
        let mut pattern = serde_json::Map::new();
        pattern.insert(field.to_string(), json!(1));
        ctx.registry
            .register(
                "test.coll",
                name,
                KeySpec::from_json(serde_json::Value::Object(pattern)),
                1,
                BuildOrigin::Local,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_build_commits_and_retires() {
        let store = MemoryCatalogStore::new();
        seed(&store, 25).await;
        let (ctx, diagnostics) = context(store.clone(), 10);

        let id = register(&ctx, "a_1", "a");
        let outcome = BuildTask::spawn(ctx.clone(), id).unwrap().wait().await.unwrap();

        assert_eq!(outcome.entries_indexed, 25);
        assert_eq!(outcome.published.descriptor.name, "a_1");
        assert!(ctx.registry.is_empty());
        assert_eq!(store.open_allocations(), 0);
        assert_eq!(diagnostics.count("build_committed"), 1);
    }

    #[tokio::test]
    async fn test_empty_namespace_commits() {
        let store = MemoryCatalogStore::new();
        let (ctx, _) = context(store.clone(), 10);

        let id = register(&ctx, "a_1", "a");
        let outcome = BuildTask::spawn(ctx, id).unwrap().wait().await.unwrap();
        assert_eq!(outcome.entries_indexed, 0);
        assert!(store.find_index("test.coll", "a_1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_allocation_failure_aborts_without_scanning() {
        let store = MemoryCatalogStore::new();
        seed(&store, 5).await;
        store.fail_next_allocations(1);
        let (ctx, diagnostics) = context(store.clone(), 10);
        let mut events = ctx.registry.subscribe();

        let id = register(&ctx, "a_1", "a");
        let err = BuildTask::spawn(ctx.clone(), id).unwrap().wait().await.unwrap_err();

        assert!(matches!(err, CoordinatorError::Storage(_)));
        assert!(ctx.registry.is_empty());
        assert_eq!(diagnostics.count("build_aborted"), 1);

        // Initializing -> Aborted, never Scanning
        let mut saw_scanning = false;
        while let Ok(event) = events.try_recv() {
            if let crate::events::BuildEvent::StateChanged { to, .. } = event {
                saw_scanning |= to == BuildState::Scanning;
            }
        }
        assert!(!saw_scanning);
    }

    #[tokio::test]
    async fn test_allocation_failure_after_abort_reports_interrupt() {
        let store = MemoryCatalogStore::new();
        seed(&store, 5).await;
        store.fail_next_allocations(1);
        let (ctx, diagnostics) = context(store.clone(), 10);

        let id = register(&ctx, "a_1", "a");
        ctx.registry.request_abort(id, "stepdown").unwrap();
        let err = BuildTask::spawn(ctx.clone(), id).unwrap().wait().await.unwrap_err();

        match err {
            CoordinatorError::BuildAbortedByInterrupt { reason, .. } => {
                assert_eq!(reason, "stepdown")
            }
            other => panic!("Expected BuildAbortedByInterrupt, got {other:?}"),
        }
        assert!(ctx.registry.is_empty());
        assert_eq!(store.open_allocations(), 0);
        assert_eq!(diagnostics.count("build_aborted"), 1);
    }

    #[tokio::test]
    async fn test_abort_during_scan_rolls_back() {
        let store = MemoryCatalogStore::new();
        seed(&store, 100).await;
        store.set_scan_delay(Duration::from_millis(10));
        let (ctx, diagnostics) = context(store.clone(), 5);

        let id = register(&ctx, "a_1", "a");
        let handle = BuildTask::spawn(ctx.clone(), id).unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        ctx.registry.request_abort(id, "stepdown").unwrap();

        let err = handle.wait().await.unwrap_err();
        match err {
            CoordinatorError::BuildAbortedByInterrupt { reason, .. } => {
                assert_eq!(reason, "stepdown")
            }
            other => panic!("Expected BuildAbortedByInterrupt, got {other:?}"),
        }
        assert!(ctx.registry.is_empty());
        assert_eq!(store.open_allocations(), 0);
        assert!(store.find_index("test.coll", "a_1").await.unwrap().is_none());
        assert_eq!(diagnostics.count("build_aborted"), 1);
    }

    #[tokio::test]
    async fn test_write_failure_aborts_and_rolls_back() {
        let store = MemoryCatalogStore::new();
        seed(&store, 30).await;
        store.fail_writes_after(1);
        let (ctx, _) = context(store.clone(), 10);

        let id = register(&ctx, "a_1", "a");
        let err = BuildTask::spawn(ctx.clone(), id).unwrap().wait().await.unwrap_err();

        assert!(matches!(err, CoordinatorError::Storage(_)));
        assert!(ctx.registry.is_empty());
        assert_eq!(store.open_allocations(), 0);
    }

    #[tokio::test]
    async fn test_fail_point_ignores_abort_until_released() {
        let store = MemoryCatalogStore::new();
        seed(&store, 10).await;
        let (ctx, _) = context(store.clone(), 5);
        ctx.fail_points.hang_after_initializing_index_build.enable();

        let id = register(&ctx, "a_1", "a");
        let handle = BuildTask::spawn(ctx.clone(), id).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.registry.request_abort(id, "stepdown").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Held at the fail point: still registered, still aborting
        assert!(!handle.is_finished());
        assert_eq!(ctx.registry.get(id).unwrap().state, BuildState::Aborting);
        assert_eq!(store.open_allocations(), 1);

        ctx.fail_points.hang_after_initializing_index_build.disable();
        assert!(matches!(
            handle.wait().await,
            Err(CoordinatorError::BuildAbortedByInterrupt { .. })
        ));
        assert_eq!(store.open_allocations(), 0);
    }

    #[tokio::test]
    async fn test_process_termination_leaves_storage_pending() {
        let store = MemoryCatalogStore::new();
        seed(&store, 10).await;
        let (ctx, _) = context(store.clone(), 5);
        ctx.fail_points.hang_after_initializing_index_build.enable();

        let id = register(&ctx, "a_1", "a");
        let handle = BuildTask::spawn(ctx.clone(), id).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        ctx.process.cancel();
        assert!(matches!(
            handle.wait().await,
            Err(CoordinatorError::Terminated(_))
        ));
        assert_eq!(store.open_allocations(), 1);
    }
}
