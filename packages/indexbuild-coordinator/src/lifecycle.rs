//! Fatal halt signalling
//!
//! The coordinator never recovers from a consistency hazard in-process. It
//! records a `FatalHalt` here; whoever owns the process terminates it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

/// Process exit code for a fatal halt
pub const FATAL_HALT_EXIT_CODE: i32 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalHalt {
    pub reason: String,
    /// Exit code the process runner should use
    pub code: i32,
    pub halted_at: DateTime<Utc>,
}

/// Broadcasts the first fatal halt; later triggers are ignored
#[derive(Clone)]
pub struct HaltSignal {
    halt: Arc<Mutex<Option<FatalHalt>>>,
    sender: Arc<broadcast::Sender<FatalHalt>>,
}

impl HaltSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            halt: Arc::new(Mutex::new(None)),
            sender: Arc::new(sender),
        }
    }

    /// Record a fatal halt, returning the one in effect
    pub fn trigger(&self, reason: impl Into<String>) -> FatalHalt {
        let mut halt = self.halt.lock();
        if let Some(existing) = halt.as_ref() {
            return existing.clone();
        }
        let fatal = FatalHalt {
            reason: reason.into(),
            code: FATAL_HALT_EXIT_CODE,
            halted_at: Utc::now(),
        };
        error!(reason = %fatal.reason, "Fatal assertion: halting replication apply path");
        *halt = Some(fatal.clone());
        // No subscribers is fine; `halt()` still reports it.
        let _ = self.sender.send(fatal.clone());
        fatal
    }

    pub fn is_halted(&self) -> bool {
        self.halt.lock().is_some()
    }

    pub fn halt(&self) -> Option<FatalHalt> {
        self.halt.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FatalHalt> {
        self.sender.subscribe()
    }

    /// Resolves once a halt has been triggered
    pub async fn wait(&self) -> FatalHalt {
        let mut rx = self.subscribe();
        if let Some(halt) = self.halt() {
            return halt;
        }
        loop {
            match rx.recv().await {
                Ok(halt) => return halt,
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if let Some(halt) = self.halt() {
                        return halt;
                    }
                }
                // The sender lives in `self`; closing cannot happen while we hold it.
                Err(broadcast::error::RecvError::Closed) => {
                    if let Some(halt) = self.halt() {
                        return halt;
                    }
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

impl Default for HaltSignal {
    fn default() -> Self {
        Self::new()
    }
}
