//! Task ownership for running nodes.
//!
//! Every running node owns exactly one long-lived task. The scheduler maps
//! node id to that task and joins it on stop, so teardown is complete by
//! the time a reload proceeds or the controller's run returns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks one task per running node.
#[derive(Default)]
pub(crate) struct Scheduler {
    tasks: Mutex<HashMap<String, RunningTask>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether a node already owns a task.
    ///
    /// A node whose run returned stays tracked (and is not restarted)
    /// until a reload removes it.
    pub(crate) fn is_running(&self, id: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(id)
    }

    /// Spawn a node's run future under its own cancellation token.
    pub(crate) fn spawn(
        &self,
        id: String,
        token: CancellationToken,
        fut: impl Future<Output = ()> + Send + 'static,
    ) {
        let handle = tokio::spawn(fut);
        let previous = self
            .tasks
            .lock()
            .unwrap()
            .insert(id, RunningTask { token, handle });
        debug_assert!(previous.is_none(), "node scheduled twice");
    }

    /// Cancel the given nodes and wait for their tasks to join.
    pub(crate) async fn stop(&self, ids: &[String]) {
        let stopping: Vec<(String, RunningTask)> = {
            let mut tasks = self.tasks.lock().unwrap();
            ids.iter()
                .filter_map(|id| tasks.remove(id).map(|t| (id.clone(), t)))
                .collect()
        };
        for (_, task) in &stopping {
            task.token.cancel();
        }
        for (id, task) in stopping {
            let _ = task.handle.await;
            debug!(component = %id, "component task joined");
        }
    }

    /// Cancel every node concurrently and wait for all tasks to join.
    pub(crate) async fn shutdown(&self) {
        let stopping: Vec<RunningTask> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain().map(|(_, task)| task).collect()
        };
        for task in &stopping {
            task.token.cancel();
        }
        for task in stopping {
            let _ = task.handle.await;
        }
    }

    /// Number of tracked node tasks.
    pub(crate) fn running_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}
