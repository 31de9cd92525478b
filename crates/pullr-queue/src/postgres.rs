//! Job queue backed by PostgreSQL.
//!
//! Deliveries are claimed with `SKIP LOCKED` so several workers can consume
//! the same queue. A claim that is not finished or rejected within the
//! visibility timeout is handed out again, which is what makes delivery
//! at-least-once when a worker dies mid-job.

use async_trait::async_trait;
use pullr_config::QueueConfig;
use pullr_core::{Envelope, Error, Listener, Queue, Result};
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notification channel used to wake listeners on publish and requeue.
const CHANNEL: &str = "pullr_queue";

fn queue_error(e: sqlx::Error) -> Error {
    Error::Queue(e.to_string())
}

/// A claimed row.
#[derive(Debug, sqlx::FromRow)]
struct Delivery {
    id: Uuid,
    body: Vec<u8>,
    deliveries: i32,
}

/// Queue driver backed by PostgreSQL.
pub struct PostgresQueue {
    pool: PgPool,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl PostgresQueue {
    /// Connect, and create the queue table if it does not exist yet.
    pub async fn connect(config: &QueueConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("postgres queue needs a url".to_string()))?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(queue_error)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Queue(e.to_string()))?;

        Ok(Self::with_pool(
            pool,
            config.poll_interval,
            config.visibility_timeout,
        ))
    }

    pub fn with_pool(pool: PgPool, poll_interval: Duration, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            poll_interval,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn put(&self, queue: &str, body: &[u8]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(queue_error)?;

        sqlx::query(
            r#"
            INSERT INTO pullr_queue (id, queue, body, deliveries, created_at)
            VALUES ($1, $2, $3, 0, NOW())
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(queue)
        .bind(body)
        .execute(&mut *tx)
        .await
        .map_err(queue_error)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(queue)
            .execute(&mut *tx)
            .await
            .map_err(queue_error)?;

        tx.commit().await.map_err(queue_error)?;
        Ok(())
    }

    async fn listen(&self, queue: &str) -> Result<Box<dyn Listener>> {
        let mut notifications = PgListener::connect_with(&self.pool)
            .await
            .map_err(queue_error)?;
        notifications.listen(CHANNEL).await.map_err(queue_error)?;

        let consumer = format!("consumer-{}", Uuid::new_v4());
        info!(queue = %queue, consumer = %consumer, "Listening on queue");

        Ok(Box::new(PostgresListener {
            pool: self.pool.clone(),
            notifications,
            queue: queue.to_string(),
            consumer,
            poll_interval: self.poll_interval,
            visibility_timeout: self.visibility_timeout,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Consumer of one PostgreSQL-backed queue.
pub struct PostgresListener {
    pool: PgPool,
    notifications: PgListener,
    queue: String,
    consumer: String,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

impl PostgresListener {
    /// Claim the oldest deliverable message, if any.
    async fn claim(&self) -> Result<Option<Delivery>> {
        sqlx::query_as::<_, Delivery>(
            r#"
            UPDATE pullr_queue
            SET claimed_by = $2, claimed_at = NOW(), deliveries = deliveries + 1
            WHERE id = (
                SELECT id FROM pullr_queue
                WHERE queue = $1
                  AND (claimed_by IS NULL
                       OR claimed_at < NOW() - make_interval(secs => $3))
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, body, deliveries
            "#,
        )
        .bind(&self.queue)
        .bind(&self.consumer)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_error)
    }
}

#[async_trait]
impl Listener for PostgresListener {
    async fn get(&mut self, cancel: &CancellationToken) -> Result<Box<dyn Envelope>> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if let Some(delivery) = self.claim().await? {
                debug!(id = %delivery.id, deliveries = delivery.deliveries, "Claimed delivery");
                return Ok(Box::new(PostgresEnvelope {
                    pool: self.pool.clone(),
                    queue: self.queue.clone(),
                    consumer: self.consumer.clone(),
                    id: delivery.id,
                    body: delivery.body,
                    attempts: u32::try_from(delivery.deliveries.saturating_sub(1)).unwrap_or(0),
                }));
            }

            // Nothing deliverable: wait for a publish, the poll interval (stale
            // claims expire without a notification) or cancellation.
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                notification = self.notifications.recv() => {
                    let notification = notification.map_err(queue_error)?;
                    if notification.payload() != self.queue {
                        debug!(queue = %notification.payload(), "Ignoring notification for other queue");
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let released = sqlx::query(
            "UPDATE pullr_queue SET claimed_by = NULL, claimed_at = NULL WHERE claimed_by = $1",
        )
        .bind(&self.consumer)
        .execute(&self.pool)
        .await
        .map_err(queue_error)?
        .rows_affected();

        if released > 0 {
            warn!(consumer = %self.consumer, released, "Released unacknowledged deliveries");
        }

        let mut notifications = self.notifications;
        notifications.unlisten_all().await.map_err(queue_error)?;
        Ok(())
    }
}

/// A message claimed by one consumer.
pub struct PostgresEnvelope {
    pool: PgPool,
    queue: String,
    consumer: String,
    id: Uuid,
    body: Vec<u8>,
    attempts: u32,
}

impl PostgresEnvelope {
    async fn delete(&self) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM pullr_queue WHERE id = $1 AND claimed_by = $2")
            .bind(self.id)
            .bind(&self.consumer)
            .execute(&self.pool)
            .await
            .map_err(queue_error)?
            .rows_affected();

        if deleted == 0 {
            return Err(self.lost());
        }
        Ok(())
    }

    fn lost(&self) -> Error {
        Error::Queue(format!(
            "delivery {} is no longer held by {}",
            self.id, self.consumer
        ))
    }
}

#[async_trait]
impl Envelope for PostgresEnvelope {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.delete().await
    }

    async fn reject(self: Box<Self>, requeue: bool) -> Result<()> {
        if !requeue {
            return self.delete().await;
        }

        let mut tx = self.pool.begin().await.map_err(queue_error)?;

        let released = sqlx::query(
            r#"
            UPDATE pullr_queue SET claimed_by = NULL, claimed_at = NULL
            WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(self.id)
        .bind(&self.consumer)
        .execute(&mut *tx)
        .await
        .map_err(queue_error)?
        .rows_affected();

        if released == 0 {
            return Err(self.lost());
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CHANNEL)
            .bind(&self.queue)
            .execute(&mut *tx)
            .await
            .map_err(queue_error)?;

        tx.commit().await.map_err(queue_error)?;
        Ok(())
    }
}
