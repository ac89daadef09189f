//! ---
//! rq_section: "02-messaging-data-model"
//! rq_subsection: "module"
//! rq_type: "source"
//! rq_scope: "code"
//! rq_description: "Queue client trait and in-process store."
//! rq_version: "v0.0.0-prealpha"
//! rq_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::Result;

/// Failures reported by a queue store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The connection to the store is unusable; retrying at this layer is pointless.
    #[error("queue connection lost: {0}")]
    Connection(String),
    /// A single command failed but the connection remains usable.
    #[error("queue command {command} failed: {reason}")]
    Command {
        /// Store primitive that failed.
        command: &'static str,
        /// Store supplied reason.
        reason: String,
    },
    /// The client was shut down by its owner.
    #[error("queue client closed")]
    Closed,
}

impl QueueError {
    /// Whether the error means the connection cannot be used any more.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Closed)
    }
}

/// Durable FIFO store offering append, blocking pop and delete.
///
/// Implementations must hand every appended item to exactly one popper, even
/// when several consumers block on the same key.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Append `value` to the tail of the list stored at `key`.
    async fn append(&self, key: &str, value: &str) -> Result<()>;

    /// Pop the head of the first non-empty list among `keys`, checked in order.
    ///
    /// Blocks until an item is available or `timeout` elapses; a zero timeout
    /// waits indefinitely. Returns the key the item was taken from.
    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;

    /// Remove `key` and everything stored under it.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Human-readable store name for logging.
    fn name(&self) -> &'static str;
}

#[derive(Default)]
struct Lists {
    lists: HashMap<String, VecDeque<String>>,
    disconnected: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<Lists>,
    notify: Notify,
}

/// Process-local store backed by a mutex protected map of lists.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of items currently stored under `key`.
    pub fn len(&self, key: &str) -> usize {
        self.shared
            .state
            .lock()
            .lists
            .get(key)
            .map_or(0, VecDeque::len)
    }

    /// Keys that currently hold at least one item, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.state.lock().lists.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Simulate a lost connection: every operation fails until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.shared.state.lock().disconnected = true;
        self.shared.notify.notify_waiters();
    }

    /// Restore a connection severed by [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        self.shared.state.lock().disconnected = false;
    }

    fn ensure_connected(state: &Lists) -> Result<()> {
        if state.disconnected {
            return Err(QueueError::Connection("in-memory store disconnected".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn append(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            Self::ensure_connected(&state)?;
            state
                .lists
                .entry(key.to_owned())
                .or_default()
                .push_back(value.to_owned());
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting the lists so an append racing with
            // the check below still wakes this waiter.
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                Self::ensure_connected(&state)?;
                let popped = keys.iter().find_map(|key| {
                    let value = state.lists.get_mut(key)?.pop_front()?;
                    Some((key.clone(), value))
                });
                if let Some((key, value)) = popped {
                    if state.lists.get(&key).is_some_and(VecDeque::is_empty) {
                        state.lists.remove(&key);
                    }
                    return Ok(Some((key, value)));
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.shared.state.lock();
        Self::ensure_connected(&state)?;
        state.lists.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_owned()).collect()
    }

    #[tokio::test]
    async fn append_then_pop_is_fifo() {
        let queue = InMemoryQueue::new();
        queue.append("jobs", "a").await.expect("append");
        queue.append("jobs", "b").await.expect("append");

        let first = queue
            .blocking_pop(&keys(&["jobs"]), Duration::from_millis(10))
            .await
            .expect("pop");
        let second = queue
            .blocking_pop(&keys(&["jobs"]), Duration::from_millis(10))
            .await
            .expect("pop");
        assert_eq!(first, Some(("jobs".into(), "a".into())));
        assert_eq!(second, Some(("jobs".into(), "b".into())));
        assert_eq!(queue.len("jobs"), 0);
        assert!(queue.keys().is_empty());
    }

    #[tokio::test]
    async fn keys_are_checked_in_order() {
        let queue = InMemoryQueue::new();
        queue.append("second", "2").await.expect("append");
        queue.append("first", "1").await.expect("append");
        let popped = queue
            .blocking_pop(&keys(&["first", "second"]), Duration::from_millis(10))
            .await
            .expect("pop");
        assert_eq!(popped, Some(("first".into(), "1".into())));
    }

    #[tokio::test]
    async fn pop_times_out_with_none() {
        let queue = InMemoryQueue::new();
        let started = Instant::now();
        let popped = queue
            .blocking_pop(&keys(&["empty"]), Duration::from_millis(50))
            .await
            .expect("pop");
        assert!(popped.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocked_pop_wakes_on_append() {
        let queue = InMemoryQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .blocking_pop(&["jobs".to_owned()], Duration::ZERO)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.append("jobs", "late").await.expect("append");
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken in time")
            .expect("join")
            .expect("pop");
        assert_eq!(popped, Some(("jobs".into(), "late".into())));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn each_item_goes_to_exactly_one_popper() {
        let queue = InMemoryQueue::new();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            waiters.push(tokio::spawn(async move {
                queue
                    .blocking_pop(&["jobs".to_owned()], Duration::from_millis(300))
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.append("jobs", "one").await.expect("append");
        queue.append("jobs", "two").await.expect("append");

        let mut received = Vec::new();
        for waiter in waiters {
            if let Some((_, value)) = waiter.await.expect("join").expect("pop") {
                received.push(value);
            }
        }
        received.sort();
        assert_eq!(received, vec!["one".to_owned(), "two".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_fails_blocked_and_new_operations() {
        let queue = InMemoryQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .blocking_pop(&["jobs".to_owned()], Duration::ZERO)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.disconnect();
        let err = waiter.await.expect("join").expect_err("pop fails");
        assert!(err.is_fatal());
        assert!(queue.append("jobs", "x").await.is_err());

        queue.reconnect();
        queue.append("jobs", "x").await.expect("append after reconnect");
    }

    #[test]
    fn error_classification() {
        assert!(QueueError::Connection("reset".into()).is_fatal());
        assert!(QueueError::Closed.is_fatal());
        assert!(!QueueError::Command {
            command: "RPUSH",
            reason: "WRONGTYPE".into()
        }
        .is_fatal());
    }
}
