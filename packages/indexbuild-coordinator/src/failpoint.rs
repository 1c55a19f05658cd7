//! Test fail points
//!
//! A fail point holds execution at a named spot while it is enabled.

use tokio::sync::watch;
use tracing::info;

#[derive(Debug)]
pub struct FailPoint {
    name: &'static str,
    enabled: watch::Sender<bool>,
}

impl FailPoint {
    pub fn new(name: &'static str) -> Self {
        let (enabled, _) = watch::channel(false);
        Self { name, enabled }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn enable(&self) {
        self.enabled.send_replace(true);
        info!(fail_point = self.name, "fail point enabled");
    }

    pub fn disable(&self) {
        self.enabled.send_replace(false);
        info!(fail_point = self.name, "fail point disabled");
    }

    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Wait until the fail point is disabled; returns whether it paused at all
    ///
    /// Nothing but `disable` releases the wait.
    pub async fn pause_while_enabled(&self) -> bool {
        let mut rx = self.enabled.subscribe();
        if !*rx.borrow_and_update() {
            return false;
        }
        info!(fail_point = self.name, "Hanging on fail point");
        while *rx.borrow_and_update() {
            // The sender lives as long as `self`, so `changed` cannot fail here.
            if rx.changed().await.is_err() {
                break;
            }
        }
        info!(fail_point = self.name, "Released from fail point");
        true
    }
}

/// Every fail point the coordinator checks
#[derive(Debug)]
pub struct FailPoints {
    /// Holds a build right after its storage is allocated
    pub hang_after_initializing_index_build: FailPoint,
}

impl Default for FailPoints {
    fn default() -> Self {
        Self {
            hang_after_initializing_index_build: FailPoint::new(
                "hangAfterInitializingIndexBuild",
            ),
        }
    }
}

impl FailPoints {
    pub fn by_name(&self, name: &str) -> Option<&FailPoint> {
        [&self.hang_after_initializing_index_build]
            .into_iter()
            .find(|fp| fp.name() == name)
    }
}
