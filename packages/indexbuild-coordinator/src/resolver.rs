//! Conflict Resolver
//!
//! Called by the applier when an incoming replicated build collides with a
//! registry entry that has not retired. It never merges, renames or reuses
//! the old build's work. It either sees the old entry retire within the
//! configured wait, or reports the conflict as unresolved, which the applier
//! escalates to a fatal halt.

use crate::build::IndexBuildEntry;
use crate::config::ConflictPolicy;
use crate::error::{CoordinatorError, Result};
use crate::events::{DiagnosticEvent, DiagnosticsSink};
use crate::registry::BuildRegistry;
use indexbuild_storage::KeySpec;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{info, warn};

/// Why an incoming build cannot be admitted yet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Existing build is aborting but has not released its name
    PendingAbort,
    /// Existing build is still running under an older term
    StaleTerm,
    /// Existing build uses the same name with a different key pattern
    KeySpecMismatch,
    /// Existing build is terminal but not retired
    PendingRetirement,
}

#[derive(Debug, Clone)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub existing: IndexBuildEntry,
    pub incoming_key_spec: KeySpec,
    pub term: u64,
}

pub struct ConflictResolver {
    registry: Arc<BuildRegistry>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(
        registry: Arc<BuildRegistry>,
        diagnostics: Arc<dyn DiagnosticsSink>,
        policy: ConflictPolicy,
    ) -> Self {
        Self {
            registry,
            diagnostics,
            policy,
        }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    /// Wait for the conflicting entry to retire
    ///
    /// `Ok(())` means the name is free and the incoming build may proceed.
    pub async fn resolve(&self, conflict: Conflict) -> Result<()> {
        let existing = &conflict.existing;
        warn!(
            namespace = %existing.namespace,
            index_name = %existing.index_name,
            existing = %existing.build_id,
            existing_state = %existing.state,
            existing_term = existing.origin_term,
            incoming_key_spec = %conflict.incoming_key_spec,
            term = conflict.term,
            kind = ?conflict.kind,
            "Index build conflict"
        );
        self.diagnostics.record(DiagnosticEvent::ConflictDetected {
            namespace: existing.namespace.clone(),
            index_name: existing.index_name.clone(),
            existing: existing.build_id,
            existing_state: existing.state,
            incoming_key_spec: conflict.incoming_key_spec.to_string(),
            term: conflict.term,
        });

        // Subscribe before re-checking so a retirement in between is not missed.
        let mut events = self.registry.subscribe();
        let started = Instant::now();
        let deadline = started + self.policy.wait_timeout();

        loop {
            let blocking = match self.blocking_entry(existing) {
                None => {
                    info!(
                        namespace = %existing.namespace,
                        index_name = %existing.index_name,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "index build conflict resolved"
                    );
                    return Ok(());
                }
                Some(entry) => entry,
            };

            if Instant::now() >= deadline {
                return Err(self.unresolved(&blocking, started));
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
                Ok(Err(RecvError::Closed)) | Err(_) => {
                    return match self.blocking_entry(existing) {
                        None => Ok(()),
                        Some(entry) => Err(self.unresolved(&entry, started)),
                    };
                }
            }
        }
    }

    // Whatever still holds the name, if anything.
    fn blocking_entry(&self, existing: &IndexBuildEntry) -> Option<IndexBuildEntry> {
        self.registry
            .find(&existing.namespace, &existing.index_name)
    }

    fn unresolved(&self, blocking: &IndexBuildEntry, started: Instant) -> CoordinatorError {
        CoordinatorError::ReplicationConflictUnresolved {
            namespace: blocking.namespace.clone(),
            index_name: blocking.index_name.clone(),
            existing: blocking.build_id,
            state: blocking.state,
            waited_ms: started.elapsed().as_millis() as u64,
        }
    }
}
