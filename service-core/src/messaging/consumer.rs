use super::{Delivery, MessageBroker};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// What the consumer loop should do with a delivery once handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Ack,
    Requeue,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> HandleOutcome;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Deliveries handled concurrently.
    pub prefetch: usize,
    /// How long a single receive blocks before the loop re-checks shutdown.
    pub poll_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 8,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Long-running task draining one queue into one handler.
pub struct QueueConsumer {
    name: &'static str,
    queue: String,
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn MessageHandler>,
    settings: ConsumerSettings,
    shutdown: CancellationToken,
}

impl QueueConsumer {
    pub fn new(
        name: &'static str,
        queue: impl Into<String>,
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name,
            queue: queue.into(),
            broker,
            handler,
            settings,
            shutdown,
        }
    }

    fn reconnect_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    pub async fn run(self) {
        let mut backoff = Self::reconnect_backoff();

        let mut subscription = loop {
            match self.broker.subscribe(&self.queue).await {
                Ok(subscription) => break subscription,
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    tracing::warn!(consumer = self.name, queue = %self.queue, error = %e, wait_ms = wait.as_millis() as u64, "Subscribe failed, retrying");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        };
        backoff.reset();

        tracing::info!(consumer = self.name, queue = %self.queue, prefetch = self.settings.prefetch, "Consumer started");

        let prefetch = self.settings.prefetch.max(1);
        let permits = Arc::new(Semaphore::new(prefetch));

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = subscription.next(self.settings.poll_interval) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    backoff.reset();
                    let broker = self.broker.clone();
                    let handler = self.handler.clone();
                    let name = self.name;
                    tokio::spawn(async move {
                        let outcome = handler.handle(&delivery).await;
                        let settled = match outcome {
                            HandleOutcome::Ack => broker.ack(&delivery).await,
                            HandleOutcome::Requeue => broker.requeue(&delivery).await,
                        };
                        if let Err(e) = settled {
                            tracing::error!(consumer = name, queue = %delivery.queue, ?outcome, error = %e, "Failed to settle delivery");
                        }
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    tracing::warn!(consumer = self.name, queue = %self.queue, error = %e, wait_ms = wait.as_millis() as u64, "Receive failed, backing off");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        // Let in-flight handlers finish before reporting shutdown.
        let _ = permits.acquire_many(prefetch as u32).await;
        tracing::info!(consumer = self.name, queue = %self.queue, "Consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        seen: AtomicUsize,
        outcome: HandleOutcome,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _delivery: &Delivery) -> HandleOutcome {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    #[tokio::test]
    async fn acks_handled_deliveries_and_stops_on_shutdown() {
        let broker = MemoryBroker::new();
        for i in 0..5u8 {
            broker.publish("jobs", &[i]).await.unwrap();
        }

        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            outcome: HandleOutcome::Ack,
        });
        let shutdown = CancellationToken::new();
        let consumer = QueueConsumer::new(
            "test",
            "jobs",
            Arc::new(broker.clone()),
            handler.clone(),
            ConsumerSettings {
                prefetch: 2,
                poll_interval: Duration::from_millis(20),
            },
            shutdown.clone(),
        );
        let task = tokio::spawn(consumer.run());

        for _ in 0..100 {
            if broker.acked() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(handler.seen.load(Ordering::SeqCst), 5);
        assert_eq!(broker.acked(), 5);
        assert!(broker.is_empty("jobs"));
    }
}
