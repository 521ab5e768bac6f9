//! Id-keyed wait/fulfill table pairing an asynchronous answer with the
//! task that asked for it.
//!
//! Used by the IPC client (awaiting `_result` replies) and by the daemon
//! (awaiting `input_response` from a UI). The map lock is only held for
//! insert/remove; waiting happens on the oneshot receiver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("request id already pending: {0}")]
    DuplicateId(String),
}

/// Receiving half of one registered request.
#[derive(Debug)]
pub struct PendingHandle<T> {
    id: String,
    rx: oneshot::Receiver<T>,
}

impl<T> PendingHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug)]
pub struct PendingRequests<T> {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<T>>>>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, id: impl Into<String>) -> Result<PendingHandle<T>, CorrelatorError> {
        let id = id.into();
        let mut map = self.map();
        if map.contains_key(&id) {
            return Err(CorrelatorError::DuplicateId(id));
        }
        let (tx, rx) = oneshot::channel();
        map.insert(id.clone(), tx);
        Ok(PendingHandle { id, rx })
    }

    /// Deliver `value` to the waiter registered under `id`. Returns false,
    /// dropping the value, when nobody is waiting (unknown id or the
    /// waiter already gave up).
    pub fn fulfill(&self, id: &str, value: T) -> bool {
        let sender = self.map().remove(id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Wait up to `timeout` for the answer. The entry is gone when this
    /// returns, whatever the outcome.
    pub async fn await_result(&self, handle: PendingHandle<T>, timeout: Duration) -> Option<T> {
        let PendingHandle { id, mut rx } = handle;
        let outcome = tokio::time::timeout(timeout, &mut rx).await;
        self.map().remove(&id);
        match outcome {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => None,
            // A fulfill that raced the deadline already removed the entry
            // and sent; take it rather than lose it.
            Err(_) => rx.try_recv().ok(),
        }
    }

    /// Drop the entry for `id`; its waiter wakes with no answer.
    pub fn cancel(&self, id: &str) -> bool {
        self.map().remove(id).is_some()
    }

    /// Release every waiter with no answer.
    pub fn clear(&self) {
        self.map().clear();
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map().contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fulfilled_request_returns_value_and_unregisters() {
        let pending = PendingRequests::<String>::new();
        let handle = pending.register("a").unwrap();
        assert!(pending.contains("a"));

        let filler = pending.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(filler.fulfill("a", "answer".to_string()));
        });

        let got = pending
            .await_result(handle, Duration::from_secs(2))
            .await;
        assert_eq!(got.as_deref(), Some("answer"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn timeout_returns_none_and_late_fulfill_is_dropped() {
        let pending = PendingRequests::<u32>::new();
        let handle = pending.register("slow").unwrap();
        let other = pending.register("other").unwrap();

        let got = pending
            .await_result(handle, Duration::from_millis(30))
            .await;
        assert_eq!(got, None);
        assert!(!pending.contains("slow"));

        // Late and unknown answers neither fail nor disturb other waiters.
        assert!(!pending.fulfill("slow", 1));
        assert!(!pending.fulfill("never-registered", 2));
        assert!(pending.contains("other"));

        assert!(pending.fulfill("other", 3));
        assert_eq!(
            pending.await_result(other, Duration::from_millis(10)).await,
            Some(3)
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let pending = PendingRequests::<()>::new();
        let _first = pending.register("dup").unwrap();
        assert_eq!(
            pending.register("dup").unwrap_err(),
            CorrelatorError::DuplicateId("dup".into())
        );
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn cancel_and_clear_wake_waiters_empty_handed() {
        let pending = PendingRequests::<u8>::new();
        let a = pending.register("a").unwrap();
        let b = pending.register("b").unwrap();

        assert!(pending.cancel("a"));
        assert_eq!(pending.await_result(a, Duration::from_secs(5)).await, None);

        pending.clear();
        assert_eq!(pending.await_result(b, Duration::from_secs(5)).await, None);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn each_waiter_gets_its_own_answer() {
        let pending = PendingRequests::<String>::new();
        let mut waits = Vec::new();
        for i in 0..8 {
            let handle = pending.register(format!("id-{i}")).unwrap();
            let p = pending.clone();
            waits.push(tokio::spawn(async move {
                p.await_result(handle, Duration::from_secs(2)).await
            }));
        }
        for i in (0..8).rev() {
            assert!(pending.fulfill(&format!("id-{i}"), format!("value-{i}")));
        }
        for (i, wait) in waits.into_iter().enumerate() {
            assert_eq!(wait.await.unwrap(), Some(format!("value-{i}")));
        }
    }
}
