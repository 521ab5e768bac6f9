//! Process-wide stop signal carrying the exit code.

use std::sync::Arc;

use tokio::sync::watch;

/// First trigger wins; later ones are ignored.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<i32>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self, code: i32) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        });
    }

    pub fn requested(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<i32>> {
        self.tx.subscribe()
    }

    /// Resolves with the exit code once a shutdown is triggered.
    pub async fn wait(&self) -> i32 {
        let mut rx = self.subscribe();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(0),
            Err(_) => 0,
        };
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_code_wins() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.requested(), None);
        let waiter = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.wait().await }
        });
        shutdown.trigger(1);
        shutdown.trigger(0);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(shutdown.requested(), Some(1));
    }

    #[tokio::test]
    async fn wait_after_trigger_returns_at_once() {
        let shutdown = Shutdown::new();
        shutdown.trigger(3);
        let code = tokio::time::timeout(std::time::Duration::from_secs(1), shutdown.wait())
            .await
            .unwrap();
        assert_eq!(code, 3);
    }
}
