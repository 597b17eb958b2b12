//! Delayed removal of finished tasks from the registry.

use std::time::Duration;

use shelf_proto::config::CleanupConfig;
use shelf_proto::protocol::TaskStatus;
use shelf_proto::registry::TaskRegistry;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long a terminal entry stays visible before it is dropped.  `None`
/// keeps it until the user dismisses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub completed: Option<Duration>,
    pub failed: Option<Duration>,
}

impl CleanupPolicy {
    pub fn from_config(config: &CleanupConfig) -> Self {
        Self {
            completed: config.completed_removal(),
            failed: config.failed_removal(),
        }
    }

    pub fn delay_for(&self, status: TaskStatus) -> Option<Duration> {
        match status {
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Pending | TaskStatus::Running => None,
        }
    }

    /// Schedule removal of entry `generation` of `id` according to its
    /// terminal `status`.
    pub fn schedule(
        &self,
        registry: &TaskRegistry,
        id: &str,
        generation: u64,
        status: TaskStatus,
    ) -> Option<JoinHandle<()>> {
        self.delay_for(status).map(|delay| {
            schedule_removal(registry.clone(), id.to_string(), generation, delay)
        })
    }
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::from_config(&CleanupConfig::default())
    }
}

/// Fire-and-forget timer that drops `id` after `delay`, but only if the
/// same entry is still there and still terminal by then.
pub fn schedule_removal(
    registry: TaskRegistry,
    id: String,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if registry.remove_terminal(&id, generation).await {
            debug!("cleanup: removed {} after {:?}", id, delay);
        }
    })
}
