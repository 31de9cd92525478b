//! In-process queue driver.
//!
//! Same delivery semantics as the broker-backed driver, without durability:
//! deliveries stay in flight until finished or rejected, and a listener that
//! closes hands its in-flight deliveries back to the queue.

use async_trait::async_trait;
use bytes::Bytes;
use pullr_core::{Envelope, Error, Listener, Queue, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct Message {
    id: u64,
    body: Bytes,
    attempts: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// Delivery id -> (listener id, message).
    in_flight: HashMap<u64, (u64, Message)>,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    notify: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueState>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Queue("connection closed".to_string()));
        }
        Ok(())
    }
}

/// Process-local queue. Clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages waiting for delivery on `queue`.
    pub fn pending(&self, queue: &str) -> usize {
        self.shared.lock().get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but neither finished nor rejected.
    pub fn in_flight(&self, queue: &str) -> usize {
        self.shared.lock().get(queue).map_or(0, |q| q.in_flight.len())
    }

    fn next_id(&self) -> u64 {
        self.shared.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, queue: &str, body: &[u8]) -> Result<()> {
        self.shared.ensure_open()?;
        let message = Message {
            id: self.next_id(),
            body: Bytes::copy_from_slice(body),
            attempts: 0,
        };
        self.shared
            .lock()
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(message);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn listen(&self, queue: &str) -> Result<Box<dyn Listener>> {
        self.shared.ensure_open()?;
        self.shared.lock().entry(queue.to_string()).or_default();
        Ok(Box::new(MemoryListener {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            id: self.next_id(),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Consumer of one in-process queue.
pub struct MemoryListener {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
}

impl MemoryListener {
    fn try_take(&self) -> Option<Message> {
        let mut queues = self.shared.lock();
        let state = queues.entry(self.queue.clone()).or_default();
        let message = state.ready.pop_front()?;
        state
            .in_flight
            .insert(message.id, (self.id, message.clone()));
        Some(message)
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn get(&mut self, cancel: &CancellationToken) -> Result<Box<dyn Envelope>> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.shared.ensure_open()?;

            // Register for wakeups before looking, so a put between the check
            // and the await is not missed.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_take() {
                debug!(queue = %self.queue, id = message.id, "Delivered message");
                return Ok(Box::new(MemoryEnvelope {
                    shared: self.shared.clone(),
                    queue: self.queue.clone(),
                    message,
                }));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let mut queues = self.shared.lock();
        if let Some(state) = queues.get_mut(&self.queue) {
            let mut released: Vec<Message> = state
                .in_flight
                .values()
                .filter(|(listener, _)| *listener == self.id)
                .map(|(_, message)| message.clone())
                .collect();
            released.sort_by_key(|m| std::cmp::Reverse(m.id));

            for message in released {
                state.in_flight.remove(&message.id);
                state.ready.push_front(message);
            }
        }
        drop(queues);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// A delivered in-process message.
pub struct MemoryEnvelope {
    shared: Arc<Shared>,
    queue: String,
    message: Message,
}

impl MemoryEnvelope {
    fn take_in_flight(&self) -> Result<Message> {
        self.shared
            .lock()
            .get_mut(&self.queue)
            .and_then(|state| state.in_flight.remove(&self.message.id))
            .map(|(_, message)| message)
            .ok_or_else(|| {
                Error::Queue(format!(
                    "delivery {} is no longer in flight",
                    self.message.id
                ))
            })
    }
}

#[async_trait]
impl Envelope for MemoryEnvelope {
    fn body(&self) -> &[u8] {
        &self.message.body
    }

    fn attempts(&self) -> u32 {
        self.message.attempts
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.take_in_flight()?;
        Ok(())
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        let mut message = self.take_in_flight()?;
        if requeue {
            message.attempts += 1;
            self.shared
                .lock()
                .entry(self.queue.clone())
                .or_default()
                .ready
                .push_back(message);
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_then_get() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        queue.put("builds", b"one").await.unwrap();

        let mut listener = queue.listen("builds").await.unwrap();
        let envelope = listener.get(&cancel).await.unwrap();

        assert_eq!(envelope.body(), b"one");
        assert_eq!(queue.pending("builds"), 0);
        assert_eq!(queue.in_flight("builds"), 1);

        envelope.finish().await.unwrap();
        assert_eq!(queue.in_flight("builds"), 0);
    }

    #[tokio::test]
    async fn test_get_waits_for_put() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        let mut listener = queue.listen("builds").await.unwrap();

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.put("builds", b"late").await.unwrap();
        });

        let envelope = listener.get(&cancel).await.unwrap();
        assert_eq!(envelope.body(), b"late");
    }

    #[tokio::test]
    async fn test_reject_requeue_redelivers() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        queue.put("builds", b"retry-me").await.unwrap();
        let mut listener = queue.listen("builds").await.unwrap();

        listener.get(&cancel).await.unwrap().reject(true).await.unwrap();
        assert_eq!(queue.pending("builds"), 1);

        let again = listener.get(&cancel).await.unwrap();
        assert_eq!(again.attempts(), 1);
        again.reject(false).await.unwrap();

        assert_eq!(queue.pending("builds"), 0);
        assert_eq!(queue.in_flight("builds"), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_blocked() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        let mut listener = queue.listen("builds").await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = listener.get(&cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_close_releases_in_flight() {
        let queue = MemoryQueue::new();
        let cancel = CancellationToken::new();
        queue.put("builds", b"a").await.unwrap();
        queue.put("builds", b"b").await.unwrap();

        let mut listener = queue.listen("builds").await.unwrap();
        let first = listener.get(&cancel).await.unwrap();
        listener.close().await.unwrap();

        assert_eq!(queue.in_flight("builds"), 0);
        assert_eq!(queue.pending("builds"), 2);
        // The released delivery can no longer be acknowledged.
        assert!(first.finish().await.is_err());

        let mut other = queue.listen("builds").await.unwrap();
        let redelivered = other.get(&cancel).await.unwrap();
        assert_eq!(redelivered.body(), b"a");
    }

    #[tokio::test]
    async fn test_queues_are_independent() {
        let queue = MemoryQueue::new();
        queue.put("a", b"1").await.unwrap();
        assert_eq!(queue.pending("a"), 1);
        assert_eq!(queue.pending("b"), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_put() {
        let queue = MemoryQueue::new();
        queue.close().await.unwrap();
        assert!(queue.put("builds", b"x").await.is_err());
    }
}
