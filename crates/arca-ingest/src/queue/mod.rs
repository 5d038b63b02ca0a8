//! Work queue abstraction
//!
//! Workers depend on this trait, not on any broker. A message is a decimal
//! work item id on a named topic. Consumers must `touch` long-running
//! messages before the redelivery timeout or the queue hands the message to
//! someone else, which would violate the at-most-one-worker rule.
//!
//! [`MemoryQueue`] is strictly per-process: each worker binary owns one,
//! fed by that binary's registry poll
//! ([`crate::workers::common::run_registry_feed`]). Hand-off between
//! stages never travels through a queue; a finishing stage writes
//! (stage = next, status = Pending) to the registry work item and the next
//! binary's poll picks it up. What the queue provides within a process is
//! delivery pacing: bounded in-flight messages, redelivery on timeout,
//! touch, finish and delayed requeue. A deployment that adds an external
//! broker implements this trait against it and the workers are unchanged.

use arca_common::{ArcaError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One delivered message plus the controls the consumer owes the broker.
pub struct Delivery {
    pub body: String,
    /// Delivery attempt, starting at 1. Redeliveries and requeues increment.
    pub attempts: u32,
    topic: String,
    state: Arc<Mutex<DeliveryState>>,
    queue: Arc<MemoryQueueInner>,
}

struct DeliveryState {
    deadline: Instant,
    finished: bool,
}

/// A cloneable handle that can reset a delivery's redelivery timer from a
/// background heartbeat task while the consumer owns the delivery itself.
#[derive(Clone)]
pub struct TouchHandle {
    state: Arc<Mutex<DeliveryState>>,
    timeout: Duration,
}

impl TouchHandle {
    pub fn touch(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.deadline = Instant::now() + self.timeout;
        }
    }
}

impl Delivery {
    /// Reset the redelivery timer. Call this during long copies and hashes.
    pub fn touch(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.deadline = Instant::now() + self.queue.message_timeout;
        }
    }

    /// Handle for a background heartbeat task.
    pub fn touch_handle(&self) -> TouchHandle {
        TouchHandle {
            state: Arc::clone(&self.state),
            timeout: self.queue.message_timeout,
        }
    }

    /// Tell the broker this message is done, successfully or not.
    pub fn finish(self) {
        if let Ok(mut state) = self.state.lock() {
            state.finished = true;
        }
        self.queue.drain(&self.topic);
    }

    /// Give the message back for another attempt after `delay`.
    pub fn requeue(self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.finished = true;
        }
        let queue = Arc::clone(&self.queue);
        let topic = self.topic.clone();
        let body = self.body.clone();
        let attempts = self.attempts;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.publish_with_attempts(&topic, &body, attempts + 1);
        });
    }
}

/// The broker interface every worker consumes.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message body (a decimal work item id) on a topic.
    async fn publish(&self, topic: &str, body: &str) -> Result<()>;

    /// Attach to a topic as the named channel and receive deliveries.
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<mpsc::Receiver<Delivery>>;
}

struct Topic {
    sender: Option<mpsc::Sender<Delivery>>,
    backlog: VecDeque<(String, u32)>,
}

struct MemoryQueueInner {
    topics: Mutex<HashMap<String, Topic>>,
    message_timeout: Duration,
    max_in_flight: usize,
}

/// In-process queue with broker semantics.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryQueueInner>,
}

impl MemoryQueue {
    pub fn new(message_timeout: Duration, max_in_flight: usize) -> Self {
        Self {
            inner: Arc::new(MemoryQueueInner {
                topics: Mutex::new(HashMap::new()),
                message_timeout,
                max_in_flight: max_in_flight.max(1),
            }),
        }
    }
}

impl MemoryQueueInner {
    fn publish_with_attempts(self: &Arc<Self>, topic: &str, body: &str, attempts: u32) {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(_) => return,
        };
        let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
            sender: None,
            backlog: VecDeque::new(),
        });
        entry.backlog.push_back((body.to_string(), attempts));
        drop(topics);
        self.drain(topic);
    }

    /// Move backlog messages into the delivery channel while it has room.
    fn drain(self: &Arc<Self>, topic: &str) {
        let mut topics = match self.topics.lock() {
            Ok(topics) => topics,
            Err(_) => return,
        };
        let Some(entry) = topics.get_mut(topic) else {
            return;
        };
        let Some(sender) = entry.sender.clone() else {
            return;
        };
        while let Some((body, attempts)) = entry.backlog.pop_front() {
            let delivery = self.make_delivery(topic, &body, attempts);
            match sender.try_send(delivery) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(rejected)) => {
                    // Channel is at max_in_flight; put it back and stop.
                    if let Ok(mut state) = rejected.state.lock() {
                        state.finished = true;
                    }
                    entry.backlog.push_front((body, attempts));
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(rejected)) => {
                    if let Ok(mut state) = rejected.state.lock() {
                        state.finished = true;
                    }
                    entry.sender = None;
                    entry.backlog.push_front((body, attempts));
                    break;
                }
            }
        }
    }

    fn make_delivery(self: &Arc<Self>, topic: &str, body: &str, attempts: u32) -> Delivery {
        let state = Arc::new(Mutex::new(DeliveryState {
            deadline: Instant::now() + self.message_timeout,
            finished: false,
        }));
        self.spawn_watchdog(topic, body, attempts, Arc::clone(&state));
        Delivery {
            body: body.to_string(),
            attempts,
            topic: topic.to_string(),
            state,
            queue: Arc::clone(self),
        }
    }

    /// Redeliver the message if the consumer neither finishes nor touches
    /// it before its deadline.
    fn spawn_watchdog(
        self: &Arc<Self>,
        topic: &str,
        body: &str,
        attempts: u32,
        state: Arc<Mutex<DeliveryState>>,
    ) {
        let queue = Arc::clone(self);
        let topic = topic.to_string();
        let body = body.to_string();
        tokio::spawn(async move {
            loop {
                let (deadline, finished) = match state.lock() {
                    Ok(state) => (state.deadline, state.finished),
                    Err(_) => return,
                };
                if finished {
                    return;
                }
                let now = Instant::now();
                if now >= deadline {
                    warn!(topic = %topic, body = %body, attempts, "message timed out, redelivering");
                    if let Ok(mut state) = state.lock() {
                        state.finished = true;
                    }
                    queue.publish_with_attempts(&topic, &body, attempts + 1);
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        });
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, topic: &str, body: &str) -> Result<()> {
        debug!(topic, body, "publishing message");
        self.inner.publish_with_attempts(topic, body, 1);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, channel: &str) -> Result<mpsc::Receiver<Delivery>> {
        let (sender, receiver) = mpsc::channel(self.inner.max_in_flight);
        {
            let mut topics = self
                .inner
                .topics
                .lock()
                .map_err(|_| ArcaError::config("queue lock poisoned", "restart the worker"))?;
            let entry = topics.entry(topic.to_string()).or_insert_with(|| Topic {
                sender: None,
                backlog: VecDeque::new(),
            });
            if entry.sender.is_some() {
                return Err(ArcaError::config(
                    format!("Topic '{}' already has a subscriber in this process", topic),
                    "Run one consumer per topic per process",
                ));
            }
            entry.sender = Some(sender);
        }
        debug!(topic, channel, "subscribed");
        self.inner.drain(topic);
        Ok(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(timeout_ms: u64) -> MemoryQueue {
        MemoryQueue::new(Duration::from_millis(timeout_ms), 10)
    }

    #[tokio::test]
    async fn test_publish_then_subscribe() {
        let q = queue(5_000);
        q.publish("fetch", "41").await.unwrap();
        q.publish("fetch", "42").await.unwrap();

        let mut rx = q.subscribe("fetch", "fetch-workers").await.unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.body, "41");
        assert_eq!(first.attempts, 1);
        first.finish();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.body, "42");
        second.finish();
    }

    #[tokio::test]
    async fn test_subscribe_then_publish() {
        let q = queue(5_000);
        let mut rx = q.subscribe("validate", "v").await.unwrap();
        q.publish("validate", "7").await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.body, "7");
        delivery.finish();
    }

    #[tokio::test]
    async fn test_double_subscribe_rejected() {
        let q = queue(5_000);
        let _rx = q.subscribe("store", "s").await.unwrap();
        assert!(q.subscribe("store", "s").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_message_redelivers_with_attempt_bump() {
        let q = queue(100);
        let mut rx = q.subscribe("record", "r").await.unwrap();
        q.publish("record", "9").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.attempts, 1);
        drop(first); // neither finished nor touched

        let second = rx.recv().await.unwrap();
        assert_eq!(second.body, "9");
        assert_eq!(second.attempts, 2);
        second.finish();
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_defers_redelivery() {
        let q = queue(100);
        let mut rx = q.subscribe("fetch", "f").await.unwrap();
        q.publish("fetch", "3").await.unwrap();
        let delivery = rx.recv().await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            delivery.touch();
        }
        // 300ms of wall time has passed against a 100ms timeout; the
        // touches kept it alive.
        assert!(rx.try_recv().is_err());
        delivery.finish();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_with_delay() {
        let q = queue(60_000);
        let mut rx = q.subscribe("restore", "r").await.unwrap();
        q.publish("restore", "12").await.unwrap();

        let delivery = rx.recv().await.unwrap();
        delivery.requeue(Duration::from_millis(500));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        let redelivered = rx.recv().await.unwrap();
        assert_eq!(redelivered.body, "12");
        assert_eq!(redelivered.attempts, 2);
        redelivered.finish();
    }
}
