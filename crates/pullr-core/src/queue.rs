//! Queue traits.
//!
//! Delivery is at-least-once: a message stays owned by the broker until its
//! envelope is explicitly finished, and every envelope must be finished or
//! rejected exactly once. `finish` and `reject` consume the envelope, so the
//! second half of that rule is enforced by ownership.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// Connection to a message broker.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Name of the driver behind this queue.
    fn name(&self) -> &'static str;

    /// Publish a persistent message.
    async fn put(&self, queue: &str, body: &[u8]) -> Result<()>;

    /// Declare (if needed) and attach to a durable queue, with manual
    /// acknowledgement.
    async fn listen(&self, queue: &str) -> Result<Box<dyn Listener>>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}

/// Consumer attached to one queue.
#[async_trait]
pub trait Listener: Send {
    /// Block until a message arrives.
    ///
    /// Returns `Error::Cancelled` once `cancel` fires; nothing is delivered
    /// after that.
    async fn get(&mut self, cancel: &CancellationToken) -> Result<Box<dyn Envelope>>;

    /// Stop consuming. Unacknowledged deliveries become visible to other
    /// consumers again.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// One delivered message.
#[async_trait]
pub trait Envelope: Send + Sync {
    fn body(&self) -> &[u8];

    /// How many times this message was delivered before, as far as the
    /// broker knows.
    fn attempts(&self) -> u32 {
        0
    }

    /// Acknowledge: the broker may delete the message.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Negative-acknowledge. With `requeue` the message is redelivered to some
    /// consumer, otherwise it is discarded.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<()>;
}
