use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// A deadline that elapsed for one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutFired {
    pub task_id: Uuid,
    /// Attempt number the watch was armed for.
    pub attempt: u32,
    /// The task's full deadline, for the failure message.
    pub seconds: u64,
}

/// Arms one deadline per in-flight task.
///
/// Expired watches are reported on the channel returned by
/// [`TimeoutMonitor::new`]. The receiver must re-check the task under its
/// lock: a response may win the race with the deadline, and a stale attempt
/// number means the task has since been re-dispatched.
pub struct TimeoutMonitor {
    watches: Arc<Mutex<HashMap<Uuid, (u32, JoinHandle<()>)>>>,
    tx: mpsc::UnboundedSender<TimeoutFired>,
}

impl TimeoutMonitor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimeoutFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            watches: Arc::new(Mutex::new(HashMap::new())),
            tx,
        };
        (monitor, rx)
    }

    /// Arm a watch for `task_id`, replacing any earlier one.
    pub fn watch(&self, task_id: Uuid, attempt: u32, seconds: u64, remaining: Duration) {
        let watches = Arc::clone(&self.watches);
        let tx = self.tx.clone();
        // Held across the spawn so an immediate expiry finds its own entry.
        let mut armed = self.watches.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            {
                let mut watches = watches.lock();
                if watches.get(&task_id).is_some_and(|(a, _)| *a == attempt) {
                    watches.remove(&task_id);
                }
            }
            debug!(task_id = %task_id, attempt, seconds, "Deadline elapsed");
            let _ = tx.send(TimeoutFired {
                task_id,
                attempt,
                seconds,
            });
        });

        if let Some((_, previous)) = armed.insert(task_id, (attempt, handle)) {
            previous.abort();
        }
    }

    /// Disarm the watch for `task_id`. Returns true if one was armed.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        match self.watches.lock().remove(&task_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_watching(&self, task_id: Uuid) -> bool {
        self.watches.lock().contains_key(&task_id)
    }

    pub fn active(&self) -> usize {
        self.watches.lock().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_watch_fires_after_deadline() {
        let (monitor, mut rx) = TimeoutMonitor::new();
        let id = Uuid::new_v4();
        monitor.watch(id, 1, 5, Duration::from_secs(5));
        assert!(monitor.is_watching(id));

        let fired = rx.recv().await.unwrap();
        assert_eq!(
            fired,
            TimeoutFired {
                task_id: id,
                attempt: 1,
                seconds: 5
            }
        );
        assert_eq!(monitor.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_watch_never_fires() {
        let (monitor, mut rx) = TimeoutMonitor::new();
        let id = Uuid::new_v4();
        monitor.watch(id, 1, 5, Duration::from_secs(5));
        assert!(monitor.cancel(id));
        assert!(!monitor.cancel(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_attempt() {
        let (monitor, mut rx) = TimeoutMonitor::new();
        let id = Uuid::new_v4();
        monitor.watch(id, 1, 5, Duration::from_secs(5));
        monitor.watch(id, 2, 30, Duration::from_secs(30));

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.attempt, 2);
        assert_eq!(fired.seconds, 30);
        assert!(rx.try_recv().is_err());
    }
}
