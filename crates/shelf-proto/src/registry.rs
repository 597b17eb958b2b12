//! TaskRegistry: the shared, de-duplicated map of in-flight and recently
//! finished generation tasks.
//!
//! Any number of views read snapshots and subscribe to change notifications;
//! writers go through the four mutation entry points.  Every operation is
//! total: unknown ids and duplicate inserts are silent no-ops.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::protocol::{TaskPatch, TrackedTask};

/// Change notification sent to observers after each effective mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(String),
    Updated(String),
    Removed(String),
    Cleared,
}

#[derive(Debug, Default)]
struct Inner {
    /// Insertion-ordered entries; ids are unique.
    tasks: Vec<TrackedTask>,
    /// Last generation handed out by `add_task`.
    generation: u64,
}

/// Cloneable handle to one registry.  Clones share state; separate
/// `TaskRegistry::new()` calls are fully independent.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }

    /// Receive a `RegistryEvent` after every effective change.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Insert `task` unless an entry with the same id exists (first writer
    /// wins).  Returns whether the task was inserted.
    pub async fn add_task(&self, mut task: TrackedTask) -> bool {
        if task.id.is_empty() {
            warn!("registry: refusing task with empty id");
            return false;
        }
        let id = task.id.clone();
        {
            let mut inner = self.inner.write().await;
            if inner.tasks.iter().any(|t| t.id == id) {
                debug!("registry: task {} already tracked, ignoring add", id);
                return false;
            }
            inner.generation += 1;
            task.generation = inner.generation;
            inner.tasks.push(task);
        }
        debug!("registry: added task {}", id);
        let _ = self.events.send(RegistryEvent::Added(id));
        true
    }

    /// Merge `patch` into the entry for `id`.  Missing ids are ignored, and
    /// so is any patch to an entry that already reached a terminal status.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> bool {
        self.apply_patch(id, patch).await.is_some()
    }

    /// Like `update_task`, but returns the generation of the patched entry
    /// so a cleanup timer can be tied to exactly this entry.
    pub async fn finish_task(&self, id: &str, patch: TaskPatch) -> Option<u64> {
        self.apply_patch(id, patch).await
    }

    async fn apply_patch(&self, id: &str, patch: TaskPatch) -> Option<u64> {
        let generation = {
            let mut inner = self.inner.write().await;
            let Some(task) = inner.tasks.iter_mut().find(|t| t.id == id) else {
                debug!("registry: update for unknown task {} dropped", id);
                return None;
            };
            if task.status.is_terminal() {
                debug!(
                    "registry: task {} is {:?}, ignoring update",
                    id, task.status
                );
                return None;
            }
            task.apply(patch);
            task.generation
        };
        let _ = self.events.send(RegistryEvent::Updated(id.to_string()));
        Some(generation)
    }

    /// Delete the entry for `id` if present.
    pub async fn remove_task(&self, id: &str) -> bool {
        {
            let mut inner = self.inner.write().await;
            let before = inner.tasks.len();
            inner.tasks.retain(|t| t.id != id);
            if inner.tasks.len() == before {
                return false;
            }
        }
        debug!("registry: removed task {}", id);
        let _ = self.events.send(RegistryEvent::Removed(id.to_string()));
        true
    }

    /// Delete the entry for `id` only while it is still terminal and still
    /// the entry of `generation`.  Used by delayed cleanup so a late timer
    /// never drops a live task or a later entry reusing the id.
    pub async fn remove_terminal(&self, id: &str, generation: u64) -> bool {
        {
            let mut inner = self.inner.write().await;
            let Some(pos) = inner.tasks.iter().position(|t| {
                t.id == id && t.generation == generation && t.status.is_terminal()
            }) else {
                return false;
            };
            inner.tasks.remove(pos);
        }
        debug!("registry: cleaned up task {}", id);
        let _ = self.events.send(RegistryEvent::Removed(id.to_string()));
        true
    }

    /// Empty the registry unconditionally.
    pub async fn clear_all_tasks(&self) {
        {
            let mut inner = self.inner.write().await;
            inner.tasks.clear();
        }
        debug!("registry: cleared");
        let _ = self.events.send(RegistryEvent::Cleared);
    }

    /// Snapshot of all entries in insertion order.
    pub async fn list_tasks(&self) -> Vec<TrackedTask> {
        self.inner.read().await.tasks.clone()
    }

    pub async fn get_task(&self, id: &str) -> Option<TrackedTask> {
        self.inner
            .read()
            .await
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.tasks.iter().any(|t| t.id == id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
