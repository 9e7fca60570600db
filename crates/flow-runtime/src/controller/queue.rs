//! The dirty-node queue feeding the scheduler's evaluation passes.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Set-backed queue of nodes whose dependents need re-evaluation.
///
/// Enqueues of an already-pending node coalesce, so each node triggers at
/// most one pass per drain. Draining yields ids in sorted order, which
/// makes evaluation order among independent dirty roots deterministic.
#[derive(Debug, Default)]
pub(crate) struct Queue {
    pending: Mutex<BTreeSet<String>>,
    notify: Notify,
}

impl Queue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mark a node dirty.
    pub(crate) fn enqueue(&self, id: &str) {
        let inserted = self.pending.lock().unwrap().insert(id.to_string());
        if inserted {
            self.notify.notify_one();
        }
    }

    /// Wait until at least one node is (or becomes) dirty.
    pub(crate) async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Take the current dirty set, sorted by node id.
    pub(crate) fn drain(&self) -> Vec<String> {
        let mut pending = self.pending.lock().unwrap();
        let drained: Vec<String> = pending.iter().cloned().collect();
        pending.clear();
        drained
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_enqueue_coalesces() {
        let queue = Queue::new();
        queue.enqueue("b");
        queue.enqueue("a");
        queue.enqueue("b");
        assert_eq!(queue.drain(), vec!["a".to_string(), "b".to_string()]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_wait_sees_prior_enqueue() {
        let queue = Queue::new();
        queue.enqueue("a");
        // The permit from the enqueue must survive until the first wait.
        tokio::time::timeout(Duration::from_secs(1), queue.wait())
            .await
            .expect("wait should resolve immediately");
        assert_eq!(queue.drain(), vec!["a".to_string()]);
    }
}
