//! Replication Applier Bridge
//!
//! Applies committed create-index log entries on this node. Before admitting
//! a replicated build it checks whether anything still holds the index name;
//! registration itself refuses a held name, so the check cannot be raced.
//! Collisions go to the conflict resolver and unresolved ones halt the apply
//! path.
//!
//! # Decision table for `apply`
//!
//! | catalog / registry state                         | outcome                 |
//! |--------------------------------------------------|-------------------------|
//! | published, same key pattern                      | no-op                   |
//! | published, different key pattern                 | `CatalogDivergence`     |
//! | no entry                                         | register + start build  |
//! | entry `Aborting`                                 | conflict                |
//! | entry running, older term                        | conflict                |
//! | entry running, same/newer term, same pattern     | no-op (duplicate)       |
//! | entry running, same/newer term, other pattern    | conflict                |
//! | entry terminal, not retired                      | conflict                |

use crate::build::{BuildId, BuildOrigin, BuildState, IndexBuildEntry};
use crate::error::{CoordinatorError, Result};
use crate::events::{BuildEvent, DiagnosticEvent};
use crate::lifecycle::HaltSignal;
use crate::replication::{CommittedLog, OpTime, OplogEntry, OplogOperation};
use crate::resolver::{Conflict, ConflictKind, ConflictResolver};
use crate::task::{BuildContext, BuildHandle, BuildTask};
use indexbuild_storage::KeySpec;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info};

/// Result of applying one entry
#[derive(Debug)]
pub enum ApplyOutcome {
    /// A replicated build was registered and started
    Started(BuildHandle),
    /// The catalog already has this index with the same key pattern
    AlreadyPublished,
    /// A live build with the same pattern already covers this entry; its
    /// position is not durable until that build commits
    AlreadyBuilding(BuildId),
    /// Entry at or before the last applied position
    Skipped,
}

/// Summary of `run_from`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub builds_committed: usize,
    pub last_applied: Option<OpTime>,
}

enum Admission {
    Done(ApplyOutcome),
    Blocked(Conflict),
    /// Name changed hands between lookup and registration
    Retry,
}

pub struct OplogApplier {
    ctx: BuildContext,
    resolver: ConflictResolver,
    halt: HaltSignal,
    last_applied: Mutex<Option<OpTime>>,
}

impl OplogApplier {
    pub fn new(ctx: BuildContext, resolver: ConflictResolver, halt: HaltSignal) -> Self {
        Self {
            ctx,
            resolver,
            halt,
            last_applied: Mutex::new(None),
        }
    }

    pub fn last_applied(&self) -> Option<OpTime> {
        *self.last_applied.lock()
    }

    pub fn set_last_applied(&self, position: Option<OpTime>) {
        *self.last_applied.lock() = position;
    }

    /// Apply a create-index entry for `(namespace, index_name)` at `op_time`
    ///
    /// # Errors
    ///
    /// Fatal errors (`ReplicationConflictUnresolved`, `CatalogDivergence`)
    /// trigger the halt signal before they are returned; afterwards every call
    /// fails with `Halted`.
    pub async fn apply(
        &self,
        namespace: &str,
        index_name: &str,
        key_spec: KeySpec,
        op_time: OpTime,
    ) -> Result<ApplyOutcome> {
        self.ensure_running()?;
        match self.admit(namespace, index_name, &key_spec, op_time).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.escalate(e)),
        }
    }

    /// Apply one log entry, skipping positions already applied
    pub async fn apply_entry(&self, entry: &OplogEntry) -> Result<ApplyOutcome> {
        self.ensure_running()?;
        if self.last_applied().map_or(false, |last| entry.op_time <= last) {
            debug!(op_time = %entry.op_time, "skipping already applied entry");
            return Ok(ApplyOutcome::Skipped);
        }

        let outcome = self.apply_operation(entry).await?;
        self.set_last_applied(Some(entry.op_time));
        Ok(outcome)
    }

    async fn apply_operation(&self, entry: &OplogEntry) -> Result<ApplyOutcome> {
        match &entry.operation {
            OplogOperation::CreateIndex { name, key_spec } => {
                self.apply(&entry.namespace, name, key_spec.clone(), entry.op_time)
                    .await
            }
        }
    }

    /// Apply every entry after the durably applied position, in order
    ///
    /// A position is made durable only once the index it creates is
    /// published: a started build is awaited, and an entry already covered by
    /// a live build waits for that build to retire and is then applied again.
    /// A crash therefore replays any entry whose build did not commit.
    pub async fn run_from(&self, log: &dyn CommittedLog) -> Result<ApplyReport> {
        let start = self.ctx.storage.last_applied().await?;
        self.set_last_applied(start);
        let entries = log.entries_after(start).await?;
        info!(
            start = ?start,
            pending = entries.len(),
            "replaying committed log"
        );

        let mut report = ApplyReport {
            last_applied: start,
            ..ApplyReport::default()
        };
        'entries: for entry in &entries {
            let mut outcome = self.apply_entry(entry).await?;
            loop {
                match outcome {
                    ApplyOutcome::Started(handle) => {
                        if let Err(e) = handle.wait().await {
                            return Err(self.escalate(replicated_failure(entry, &e)));
                        }
                        report.builds_committed += 1;
                        break;
                    }
                    ApplyOutcome::AlreadyBuilding(build_id) => {
                        debug!(%build_id, op_time = %entry.op_time, "waiting for covering build");
                        self.wait_for_retirement(build_id).await?;
                        outcome = self.apply_operation(entry).await?;
                    }
                    ApplyOutcome::AlreadyPublished => break,
                    ApplyOutcome::Skipped => continue 'entries,
                }
            }
            self.ctx.storage.record_applied(entry.op_time).await?;
            report.applied += 1;
            report.last_applied = Some(entry.op_time);
        }
        Ok(report)
    }

    async fn admit(
        &self,
        namespace: &str,
        index_name: &str,
        key_spec: &KeySpec,
        op_time: OpTime,
    ) -> Result<ApplyOutcome> {
        loop {
            match self.try_admit(namespace, index_name, key_spec, op_time).await? {
                Admission::Done(outcome) => return Ok(outcome),
                Admission::Blocked(conflict) => self.resolver.resolve(conflict).await?,
                Admission::Retry => continue,
            }
        }
    }

    async fn try_admit(
        &self,
        namespace: &str,
        index_name: &str,
        key_spec: &KeySpec,
        op_time: OpTime,
    ) -> Result<Admission> {
        let term = op_time.term;

        if let Some(existing) = self.ctx.registry.find(namespace, index_name) {
            return Ok(match classify(&existing, key_spec, term) {
                Some(kind) => Admission::Blocked(Conflict {
                    kind,
                    existing,
                    incoming_key_spec: key_spec.clone(),
                    term,
                }),
                None => {
                    debug!(
                        build_id = %existing.build_id,
                        namespace, index_name, "duplicate delivery of a live build"
                    );
                    Admission::Done(ApplyOutcome::AlreadyBuilding(existing.build_id))
                }
            });
        }

        if let Some(published) = self.ctx.storage.find_index(namespace, index_name).await? {
            if &published.descriptor.key_spec == key_spec {
                debug!(namespace, index_name, "index already published, skipping");
                return Ok(Admission::Done(ApplyOutcome::AlreadyPublished));
            }
            return Err(CoordinatorError::CatalogDivergence {
                namespace: namespace.to_string(),
                index_name: index_name.to_string(),
                published: published.descriptor.key_spec.to_string(),
                replicated: key_spec.to_string(),
            });
        }

        let build_id = match self.ctx.registry.register(
            namespace,
            index_name,
            key_spec.clone(),
            term,
            BuildOrigin::Replicated { op_time },
        ) {
            Ok(id) => id,
            // Something took the name since the lookup; classify it on the next pass.
            Err(CoordinatorError::NameConflict { .. }) => return Ok(Admission::Retry),
            Err(e) => return Err(e),
        };

        info!(%build_id, namespace, index_name, %op_time, "starting replicated index build");
        let handle = BuildTask::spawn(self.ctx.clone(), build_id)?;
        Ok(Admission::Done(ApplyOutcome::Started(handle)))
    }

    /// Resolves once `build_id` has left the registry, whatever its final state
    async fn wait_for_retirement(&self, build_id: BuildId) -> Result<()> {
        let mut events = self.ctx.registry.subscribe();
        loop {
            if self.ctx.registry.get(build_id).is_none() {
                return Ok(());
            }
            tokio::select! {
                _ = self.ctx.process.cancelled() => {
                    return Err(CoordinatorError::Terminated(build_id));
                }
                event = events.recv() => match event {
                    Ok(BuildEvent::Retired { build_id: retired, .. }) if retired == build_id => {
                        return Ok(());
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        return Err(CoordinatorError::internal("registry event channel closed"));
                    }
                },
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.halt.halt() {
            Some(halt) => Err(CoordinatorError::Halted(halt.reason)),
            None => Ok(()),
        }
    }

    fn escalate(&self, err: CoordinatorError) -> CoordinatorError {
        if !err.is_fatal() || matches!(err, CoordinatorError::Halted(_)) {
            return err;
        }
        error!(error = %err, "replicated index build cannot be applied safely");
        let halt = self.halt.trigger(err.to_string());
        self.ctx.diagnostics.record(DiagnosticEvent::FatalHalt {
            reason: halt.reason,
        });
        err
    }
}

/// `None` if the live entry already covers the incoming build
fn classify(existing: &IndexBuildEntry, key_spec: &KeySpec, term: u64) -> Option<ConflictKind> {
    match existing.state {
        BuildState::Aborting => Some(ConflictKind::PendingAbort),
        BuildState::Aborted | BuildState::Committed => Some(ConflictKind::PendingRetirement),
        BuildState::Initializing | BuildState::Scanning => {
            if existing.origin_term < term {
                Some(ConflictKind::StaleTerm)
            } else if &existing.key_spec != key_spec {
                Some(ConflictKind::KeySpecMismatch)
            } else {
                None
            }
        }
    }
}

fn replicated_failure(entry: &OplogEntry, cause: &CoordinatorError) -> CoordinatorError {
    let index_name = match &entry.operation {
        OplogOperation::CreateIndex { name, .. } => name.clone(),
    };
    CoordinatorError::ReplicatedBuildFailed {
        namespace: entry.namespace.clone(),
        index_name,
        reason: cause.to_string(),
    }
}
