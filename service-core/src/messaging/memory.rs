//! In-process broker used by tests and single-node development runs.

use super::{Delivery, MessageBroker, Subscription};
use crate::error::AppError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    notify: Notify,
    fail_publish: AtomicBool,
    acked: AtomicUsize,
    requeued: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail until reset.
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Remove and return every message waiting on `queue`, oldest first.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .get_mut(queue)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drain `queue` and decode each message as JSON.
    pub fn drain_json<T: serde::de::DeserializeOwned>(&self, queue: &str) -> Vec<T> {
        self.drain(queue)
            .iter()
            .filter_map(|payload| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub fn len(&self, queue: &str) -> usize {
        let queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get(queue).map(VecDeque::len).unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    pub fn acked(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn requeued(&self) -> usize {
        self.inner.requeued.load(Ordering::SeqCst)
    }

    fn push(&self, queue: &str, payload: Vec<u8>) {
        {
            let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
            queues.entry(queue.to_string()).or_default().push_back(payload);
        }
        self.inner.notify.notify_waiters();
    }

    fn pop(&self, queue: &str) -> Option<Vec<u8>> {
        let mut queues = self.inner.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues.get_mut(queue).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), AppError> {
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(AppError::BrokerError(anyhow::anyhow!(
                "Publish to {} rejected",
                queue
            )));
        }
        self.push(queue, payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, AppError> {
        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), AppError> {
        self.inner.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> Result<(), AppError> {
        self.inner.requeued.fetch_add(1, Ordering::SeqCst);
        self.push(&delivery.queue, delivery.payload.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}

struct MemorySubscription {
    broker: MemoryBroker,
    queue: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, AppError> {
        let notified = self.broker.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(payload) = self.broker.pop(&self.queue) {
            return Ok(Some(self.delivery(payload)));
        }

        if tokio::time::timeout(wait, notified).await.is_err() {
            return Ok(None);
        }

        Ok(self.broker.pop(&self.queue).map(|p| self.delivery(p)))
    }
}

impl MemorySubscription {
    fn delivery(&self, payload: Vec<u8>) -> Delivery {
        Delivery {
            queue: self.queue.clone(),
            payload,
            receipt: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = MemoryBroker::new();
        broker.publish("q", b"one").await.unwrap();
        broker.publish("q", b"two").await.unwrap();

        let mut sub = broker.subscribe("q").await.unwrap();
        let first = sub.next(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = sub.next(Duration::from_millis(10)).await.unwrap().unwrap();

        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
        assert!(sub.next(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wakes_waiting_subscriber() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("q").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("q", b"late").await.unwrap();
        });

        let delivery = sub.next(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn publish_failure_toggle() {
        let broker = MemoryBroker::new();
        broker.set_publish_failure(true);
        assert!(broker.publish("q", b"x").await.is_err());
        broker.set_publish_failure(false);
        assert!(broker.publish("q", b"x").await.is_ok());
        assert_eq!(broker.len("q"), 1);
    }

    #[tokio::test]
    async fn requeue_puts_message_back() {
        let broker = MemoryBroker::new();
        broker.publish("q", b"retry-me").await.unwrap();
        let mut sub = broker.subscribe("q").await.unwrap();
        let delivery = sub.next(Duration::from_millis(10)).await.unwrap().unwrap();

        broker.requeue(&delivery).await.unwrap();

        assert_eq!(broker.requeued(), 1);
        assert_eq!(broker.drain("q"), vec![b"retry-me".to_vec()]);
    }
}
