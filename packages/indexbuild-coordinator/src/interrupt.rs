//! Interrupt Controller
//!
//! Turns a loss of leadership into abort requests for every build that was
//! started under the lost term or earlier. It only flips registry state and
//! cancels tokens; the build tasks do their own rollback.

use crate::build::BuildId;
use crate::error::CoordinatorError;
use crate::events::{DiagnosticEvent, DiagnosticsSink};
use crate::registry::{AbortRequest, BuildRegistry};
use std::sync::Arc;
use tracing::{debug, info};

pub struct InterruptController {
    registry: Arc<BuildRegistry>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl InterruptController {
    pub fn new(registry: Arc<BuildRegistry>, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            registry,
            diagnostics,
        }
    }

    /// Request abort of every running build with `origin_term <= term`
    ///
    /// Returns the builds that moved to `Aborting`. Does not wait for them.
    pub fn on_leadership_lost(&self, term: u64) -> Vec<BuildId> {
        let reason = format!("interrupted due to loss of leadership in term {}", term);
        let mut aborted = Vec::new();

        for entry in self.registry.entries() {
            if !entry.state.is_running() || entry.origin_term > term {
                continue;
            }
            match self.registry.request_abort(entry.build_id, &reason) {
                Ok(AbortRequest::Requested) => {
                    info!(
                        build_id = %entry.build_id,
                        namespace = %entry.namespace,
                        index_name = %entry.index_name,
                        term,
                        "aborting index build on stepdown"
                    );
                    self.diagnostics.record(DiagnosticEvent::AbortInitiated {
                        build_id: entry.build_id,
                        namespace: entry.namespace.clone(),
                        index_name: entry.index_name.clone(),
                        term,
                    });
                    aborted.push(entry.build_id);
                }
                Ok(other) => {
                    debug!(build_id = %entry.build_id, outcome = ?other, "abort not needed");
                }
                // Retired between the snapshot and the request.
                Err(CoordinatorError::BuildNotFound(_)) => {}
                Err(e) => {
                    debug!(build_id = %entry.build_id, error = %e, "abort request failed");
                }
            }
        }

        info!(term, aborted = aborted.len(), "leadership lost");
        aborted
    }
}
