//! Ordered submission queue for outbound requests
//!
//! Each submitted operation runs the request and its continuation while
//! holding the queue; the next submission is admitted only afterwards. tokio's
//! mutex is fair, so submissions are served in arrival order.
//!
//! Operations must not submit to the same queue from inside their closure.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct RequestQueue {
    gate: Mutex<()>,
    waiting: AtomicUsize,
    dispatched: AtomicU64,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` once every earlier submission has completed
    pub async fn submit<F, Fut, T>(&self, label: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let _turn = self.gate.lock().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        let seq = self.dispatched.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Dispatching request #{} ({})", seq, label);
        operation().await
    }

    /// Submissions waiting for their turn
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_submission_waits_for_first_continuation() {
        let queue = Arc::new(RequestQueue::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = {
            let (queue, log) = (queue.clone(), log.clone());
            tokio::spawn(async move {
                queue
                    .submit("first", || async {
                        log.lock().unwrap().push("first:start");
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        log.lock().unwrap().push("first:continuation");
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let (queue, log) = (queue.clone(), log.clone());
            tokio::spawn(async move {
                queue
                    .submit("second", || async {
                        log.lock().unwrap().push("second:start");
                    })
                    .await
            })
        };

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:start", "first:continuation", "second:start"]
        );
        assert_eq!(queue.dispatched(), 2);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_returns_operation_output() {
        let queue = RequestQueue::new();
        let value = queue.submit("answer", || async { 42 }).await;
        assert_eq!(value, 42);
    }
}
