//! Hand-off queue between the proxy and the scanning pipeline.
//!
//! One publisher clone per proxied connection, one queue-side consumer. The
//! queue preserves each connection's own publish order; nothing is promised
//! across connections. Publishing is bounded-best-effort so a slow consumer
//! can never stall forwarding.

use std::time::Duration;

use scan_types::CapturedExchange;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Producer side; cheap to clone, one logical producer per connection.
#[derive(Clone)]
pub struct CapturePublisher {
    tx: mpsc::Sender<CapturedExchange>,
}

impl CapturePublisher {
    /// Publish an exchange, waiting at most `timeout` for queue space.
    /// Returns whether the entry was accepted; a full queue drops the entry.
    pub async fn publish(&self, exchange: CapturedExchange, timeout: Duration) -> bool {
        match self.tx.send_timeout(exchange, timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(dropped)) => {
                warn!(
                    target: "capture-proxy",
                    target_uri = %dropped.request.target,
                    "capture queue full; dropping exchange"
                );
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }
}

/// Consumer side of the capture queue.
pub struct CaptureQueue {
    rx: Mutex<mpsc::Receiver<CapturedExchange>>,
}

impl CaptureQueue {
    /// Create a bounded queue, returning the publisher and consumer halves.
    pub fn bounded(capacity: usize) -> (CapturePublisher, CaptureQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            CapturePublisher { tx },
            CaptureQueue { rx: Mutex::new(rx) },
        )
    }

    /// Receive the next exchange; `None` once every publisher is gone and
    /// the queue is empty.
    pub async fn recv(&self) -> Option<CapturedExchange> {
        self.rx.lock().await.recv().await
    }

    /// Take whatever is queued right now without waiting.
    pub async fn try_drain(&self) -> Vec<CapturedExchange> {
        let mut rx = self.rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(exchange) = rx.try_recv() {
            drained.push(exchange);
        }
        drained
    }

    /// Discard queued entries; used between scanning sessions.
    pub async fn clear(&self) {
        let _ = self.try_drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scan_types::{HttpRequest, HttpResponse};

    fn exchange(tag: &str) -> CapturedExchange {
        CapturedExchange {
            request: HttpRequest {
                method: "GET".to_string(),
                target: format!("/{tag}"),
                version: 1,
                headers: Vec::new(),
                body: Vec::new(),
            },
            response: HttpResponse {
                version: 1,
                status: 200,
                reason: "OK".to_string(),
                headers: Vec::new(),
                body: tag.as_bytes().to_vec(),
            },
        }
    }

    #[tokio::test]
    async fn preserves_publish_order_per_producer() {
        let (publisher, queue) = CaptureQueue::bounded(8);

        for tag in ["a", "b", "c"] {
            assert!(publisher.publish(exchange(tag), Duration::from_secs(1)).await);
        }

        assert_eq!(queue.recv().await.expect("a").request.target, "/a");
        assert_eq!(queue.recv().await.expect("b").request.target, "/b");
        assert_eq!(queue.recv().await.expect("c").request.target, "/c");
    }

    #[tokio::test]
    async fn full_queue_drops_after_bounded_wait() {
        let (publisher, _queue) = CaptureQueue::bounded(1);

        assert!(publisher.publish(exchange("kept"), Duration::from_millis(10)).await);

        let start = std::time::Instant::now();
        let accepted = publisher.publish(exchange("dropped"), Duration::from_millis(50)).await;
        assert!(!accepted);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn clear_discards_queued_entries() {
        let (publisher, queue) = CaptureQueue::bounded(8);
        publisher.publish(exchange("stale"), Duration::from_secs(1)).await;

        queue.clear().await;
        drop(publisher);

        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_publishers_lose_nothing() {
        let (publisher, queue) = CaptureQueue::bounded(64);

        let mut tasks = Vec::new();
        for worker in 0..8 {
            let publisher = publisher.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..4 {
                    let accepted = publisher
                        .publish(exchange(&format!("{worker}-{i}")), Duration::from_secs(1))
                        .await;
                    assert!(accepted);
                }
            }));
        }
        for task in tasks {
            task.await.expect("publisher task");
        }
        drop(publisher);

        let mut count = 0;
        while queue.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 32);
    }
}
