use crate::applier::OplogApplier;
use crate::build::{BuildId, BuildOrigin};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::events::DiagnosticsSink;
use crate::failpoint::FailPoints;
use crate::interrupt::InterruptController;
use crate::lifecycle::HaltSignal;
use crate::registry::BuildRegistry;
use crate::replication::{LeadershipChange, LeadershipEvent, OpTime, ReplicationState, Role};
use crate::resolver::ConflictResolver;
use crate::task::{BuildContext, BuildHandle, BuildTask};
use indexbuild_storage::{IndexCatalogStore, KeySpec, PendingBuild};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What startup recovery cleaned up
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Builds whose storage was allocated but never published
    pub rolled_back: Vec<PendingBuild>,
    /// Replay resumes after this position
    pub last_applied: Option<OpTime>,
}

/// One node's index build coordination
///
/// Owns the registry and wires the build tasks, the interrupt controller and
/// the applier bridge to the same storage, diagnostics and halt signal.
pub struct IndexBuildCoordinator {
    ctx: BuildContext,
    replication: ReplicationState,
    interrupt: InterruptController,
    applier: OplogApplier,
    halt: HaltSignal,
}

impl IndexBuildCoordinator {
    /// Create a coordinator with an empty registry; the node starts as a secondary in term 0
    pub fn new(
        config: CoordinatorConfig,
        storage: Arc<dyn IndexCatalogStore>,
        diagnostics: Arc<dyn DiagnosticsSink>,
    ) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(BuildRegistry::new(config.event_channel_capacity));
        let ctx = BuildContext {
            registry: registry.clone(),
            storage,
            diagnostics: diagnostics.clone(),
            fail_points: Arc::new(FailPoints::default()),
            config: Arc::new(config.clone()),
            process: CancellationToken::new(),
        };
        let halt = HaltSignal::new();
        let resolver =
            ConflictResolver::new(registry.clone(), diagnostics.clone(), config.conflict.clone());

        Ok(Self {
            interrupt: InterruptController::new(registry, diagnostics),
            applier: OplogApplier::new(ctx.clone(), resolver, halt.clone()),
            replication: ReplicationState::default(),
            halt,
            ctx,
        })
    }

    pub fn registry(&self) -> &Arc<BuildRegistry> {
        &self.ctx.registry
    }

    pub fn storage(&self) -> &Arc<dyn IndexCatalogStore> {
        &self.ctx.storage
    }

    pub fn fail_points(&self) -> &FailPoints {
        &self.ctx.fail_points
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.ctx.config
    }

    pub fn replication(&self) -> &ReplicationState {
        &self.replication
    }

    pub fn halt_signal(&self) -> &HaltSignal {
        &self.halt
    }

    pub fn applier(&self) -> &OplogApplier {
        &self.applier
    }

    /// Startup cleanup: roll back every build a previous process left pending
    pub async fn recover(&self) -> Result<RecoveryReport> {
        if !self.ctx.registry.is_empty() {
            return Err(CoordinatorError::internal(
                "recovery must run before any index build is registered",
            ));
        }

        let rolled_back = self.ctx.storage.rollback_pending_builds().await?;
        for build in &rolled_back {
            info!(
                build_id = %build.build_id,
                namespace = %build.descriptor.namespace,
                index_name = %build.descriptor.name,
                entries_written = build.entries_written,
                "rolled back unfinished index build"
            );
        }

        let last_applied = self.ctx.storage.last_applied().await?;
        self.applier.set_last_applied(last_applied);
        info!(
            rolled_back = rolled_back.len(),
            last_applied = ?last_applied,
            "index build recovery complete"
        );
        Ok(RecoveryReport {
            rolled_back,
            last_applied,
        })
    }

    /// Local create-index command; only the primary accepts it
    pub async fn start_index_build(
        &self,
        namespace: &str,
        index_name: &str,
        key_spec: KeySpec,
    ) -> Result<BuildHandle> {
        if let Some(halt) = self.halt.halt() {
            return Err(CoordinatorError::Halted(halt.reason));
        }
        let member = self.replication.current();
        if member.role != Role::Primary {
            return Err(CoordinatorError::NotPrimary {
                namespace: namespace.to_string(),
                index_name: index_name.to_string(),
            });
        }
        if self
            .ctx
            .storage
            .find_index(namespace, index_name)
            .await?
            .is_some()
        {
            return Err(CoordinatorError::IndexAlreadyExists {
                namespace: namespace.to_string(),
                index_name: index_name.to_string(),
            });
        }

        let build_id = self.ctx.registry.register(
            namespace,
            index_name,
            key_spec,
            member.term,
            BuildOrigin::Local,
        )?;

        // A stepdown that ran between the role check and registration did not see this build.
        let now = self.replication.current();
        if now.role != Role::Primary || now.term != member.term {
            warn!(%build_id, term = member.term, "leadership changed while starting index build");
            self.ctx.registry.request_abort(
                build_id,
                &format!(
                    "interrupted due to loss of leadership in term {}",
                    member.term
                ),
            )?;
        }

        BuildTask::spawn(self.ctx.clone(), build_id)
    }

    /// Apply a leadership notification; returns builds asked to abort
    pub fn on_leadership_change(&self, event: LeadershipEvent) -> Vec<BuildId> {
        match self.replication.apply(event) {
            LeadershipChange::SteppedDown { term } => {
                info!(term, new_term = event.term, "stepping down");
                self.interrupt.on_leadership_lost(term)
            }
            LeadershipChange::SteppedUp { term } => {
                info!(term, "stepped up to primary");
                Vec::new()
            }
            LeadershipChange::Stale => {
                warn!(term = event.term, current = self.replication.term(), "ignoring stale leadership event");
                Vec::new()
            }
            LeadershipChange::Unchanged => Vec::new(),
        }
    }

    pub fn step_up(&self, term: u64) {
        self.on_leadership_change(LeadershipEvent::step_up(term));
    }

    pub fn step_down(&self, term: u64) -> Vec<BuildId> {
        self.on_leadership_change(LeadershipEvent::step_down(term))
    }

    /// Follow leadership notifications from the consensus layer until the
    /// sender goes away or the node terminates
    pub fn watch_leadership(
        self: Arc<Self>,
        mut events: watch::Receiver<LeadershipEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let initial = *events.borrow_and_update();
            self.on_leadership_change(initial);
            loop {
                tokio::select! {
                    _ = self.ctx.process.cancelled() => break,
                    changed = events.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let event = *events.borrow_and_update();
                        self.on_leadership_change(event);
                    }
                }
            }
        })
    }

    /// Simulate process death: every build task stops where it is, with no
    /// rollback and no registry cleanup
    pub fn terminate(&self) {
        warn!(live_builds = self.ctx.registry.len(), "terminating node");
        self.ctx.process.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingDiagnostics;
    use indexbuild_storage::MemoryCatalogStore;
    use serde_json::json;

    fn coordinator(store: MemoryCatalogStore) -> IndexBuildCoordinator {
        IndexBuildCoordinator::new(
            CoordinatorConfig::default(),
            Arc::new(store),
            Arc::new(RecordingDiagnostics::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_secondary_rejects_local_build() {
        let node = coordinator(MemoryCatalogStore::new());
        let err = node
            .start_index_build("test.coll", "a_1", KeySpec::from_json(json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::NotPrimary { .. }));
        assert!(node.registry().is_empty());
    }

    #[tokio::test]
    async fn test_primary_builds_index() {
        let store = MemoryCatalogStore::new();
        store
            .insert_documents("test.coll", vec![json!({"a": 1}), json!({"a": 2})])
            .await
            .unwrap();
        let node = coordinator(store.clone());
        node.step_up(1);

        let outcome = node
            .start_index_build("test.coll", "a_1", KeySpec::from_json(json!({"a": 1})))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.entries_indexed, 2);

        let err = node
            .start_index_build("test.coll", "a_1", KeySpec::from_json(json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::IndexAlreadyExists { .. }));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = IndexBuildCoordinator::new(
            CoordinatorConfig::default().with_scan_chunk_size(0),
            Arc::new(MemoryCatalogStore::new()),
            Arc::new(RecordingDiagnostics::new()),
        );
        assert!(matches!(result, Err(CoordinatorError::Config(_))));
    }

    #[tokio::test]
    async fn test_recover_reports_last_applied() {
        let store = MemoryCatalogStore::new();
        store.record_applied(OpTime::new(2, 9)).await.unwrap();
        let node = coordinator(store);

        let report = node.recover().await.unwrap();
        assert!(report.rolled_back.is_empty());
        assert_eq!(report.last_applied, Some(OpTime::new(2, 9)));
        assert_eq!(node.applier().last_applied(), Some(OpTime::new(2, 9)));
    }
}
