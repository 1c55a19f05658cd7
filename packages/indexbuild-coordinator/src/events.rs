//! Observable events
//!
//! - `BuildEvent`: registry state changes, broadcast to the applier bridge
//!   and anyone else waiting on a build
//! - `DiagnosticEvent`: structured events for the diagnostics collaborator

use crate::build::{BuildId, BuildState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// Registry state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Registered {
        build_id: BuildId,
        namespace: String,
        index_name: String,
    },
    StateChanged {
        build_id: BuildId,
        namespace: String,
        index_name: String,
        from: BuildState,
        to: BuildState,
    },
    Retired {
        build_id: BuildId,
        namespace: String,
        index_name: String,
        final_state: BuildState,
    },
}

impl BuildEvent {
    pub fn build_id(&self) -> BuildId {
        match self {
            BuildEvent::Registered { build_id, .. }
            | BuildEvent::StateChanged { build_id, .. }
            | BuildEvent::Retired { build_id, .. } => *build_id,
        }
    }
}

/// Structured diagnostics event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    BuildStarted {
        build_id: BuildId,
        namespace: String,
        index_name: String,
        key_spec: String,
        origin_term: u64,
    },
    AbortInitiated {
        build_id: BuildId,
        namespace: String,
        index_name: String,
        term: u64,
    },
    BuildAborted {
        build_id: BuildId,
        namespace: String,
        index_name: String,
        reason: String,
    },
    BuildCommitted {
        build_id: BuildId,
        namespace: String,
        index_name: String,
        entries_indexed: u64,
    },
    ConflictDetected {
        namespace: String,
        index_name: String,
        existing: BuildId,
        existing_state: BuildState,
        incoming_key_spec: String,
        term: u64,
    },
    FatalHalt {
        reason: String,
    },
}

impl DiagnosticEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticEvent::BuildStarted { .. } => "build_started",
            DiagnosticEvent::AbortInitiated { .. } => "abort_initiated",
            DiagnosticEvent::BuildAborted { .. } => "build_aborted",
            DiagnosticEvent::BuildCommitted { .. } => "build_committed",
            DiagnosticEvent::ConflictDetected { .. } => "conflict_detected",
            DiagnosticEvent::FatalHalt { .. } => "fatal_halt",
        }
    }
}

/// Diagnostics collaborator
pub trait DiagnosticsSink: Send + Sync {
    fn record(&self, event: DiagnosticEvent);
}

/// Emits every diagnostics event as a tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn record(&self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::BuildStarted {
                build_id,
                namespace,
                index_name,
                key_spec,
                origin_term,
            } => info!(
                %build_id, %namespace, %index_name, %key_spec, origin_term,
                "index build: starting"
            ),
            DiagnosticEvent::AbortInitiated {
                build_id,
                namespace,
                index_name,
                term,
            } => info!(%build_id, %namespace, %index_name, term, "index build: abort requested"),
            DiagnosticEvent::BuildAborted {
                build_id,
                namespace,
                index_name,
                reason,
            } => info!(%build_id, %namespace, %index_name, %reason, "Index build aborted"),
            DiagnosticEvent::BuildCommitted {
                build_id,
                namespace,
                index_name,
                entries_indexed,
            } => info!(
                %build_id, %namespace, %index_name, entries_indexed,
                "index build: done building"
            ),
            DiagnosticEvent::ConflictDetected {
                namespace,
                index_name,
                existing,
                existing_state,
                incoming_key_spec,
                term,
            } => warn!(
                %namespace, %index_name, %existing, %existing_state, %incoming_key_spec, term,
                "Index build conflict detected"
            ),
            DiagnosticEvent::FatalHalt { reason } => error!(%reason, "Fatal halt"),
        }
    }
}

/// Keeps events in memory (tests, debugging)
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl RecordingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiagnosticEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl DiagnosticsSink for RecordingDiagnostics {
    fn record(&self, event: DiagnosticEvent) {
        self.events.lock().push(event);
    }
}
