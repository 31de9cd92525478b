//! Build listener: the per-process consumption loop.
//!
//! Jobs are handled one at a time. Every delivered envelope is finished or
//! rejected exactly once, except when the process is shutting down with a job
//! in flight: that envelope is left alone and goes back to the broker when
//! the listener closes.

use async_trait::async_trait;
use pullr_config::ListenerConfig;
use pullr_core::{BuildJob, Envelope, Error, Listener, Queue, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cancellation scope of one job.
///
/// The job token is cancelled when the process shuts down or when the job
/// runs out of time; [`JobContext::is_timed_out`] tells the two apart.
#[derive(Debug)]
pub struct JobContext {
    token: CancellationToken,
    shutdown: CancellationToken,
    timed_out: AtomicBool,
}

impl JobContext {
    /// A job scope under the process-wide `shutdown` token.
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            token: shutdown.child_token(),
            shutdown: shutdown.clone(),
            timed_out: AtomicBool::new(false),
        }
    }

    /// Token every stage of the job must honour.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Mark the job as out of time and cancel it.
    pub fn expire(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Runs one validated build job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, job: &BuildJob) -> Result<()>;
}

/// What handling one delivery did to the failure counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Failed,
    Shutdown,
}

/// Consumes build jobs from one queue until shutdown or until too many
/// consecutive jobs have failed.
pub struct BuildListener {
    queue: Arc<dyn Queue>,
    queue_name: String,
    config: ListenerConfig,
    handler: Arc<dyn JobHandler>,
}

impl BuildListener {
    pub fn new(
        queue: Arc<dyn Queue>,
        queue_name: impl Into<String>,
        config: ListenerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            config,
            handler,
        }
    }

    /// Consume until `cancel` fires (returns `Ok`) or `max_errors`
    /// consecutive failures are reached (returns
    /// `Error::TooManyFailures`).
    pub async fn listen(&self, cancel: &CancellationToken) -> Result<()> {
        let mut listener = self.queue.listen(&self.queue_name).await?;
        info!(
            queue = %self.queue_name,
            driver = %self.queue.name(),
            max_errors = self.config.max_errors,
            "Listening for build jobs"
        );

        let result = self.consume(cancel, listener.as_mut()).await;

        if let Err(e) = listener.close().await {
            warn!(queue = %self.queue_name, error = %e, "Failed to close listener");
        }
        result
    }

    async fn consume(&self, cancel: &CancellationToken, listener: &mut dyn Listener) -> Result<()> {
        let mut failures = 0u32;

        loop {
            if failures >= self.config.max_errors {
                error!(failures, "Too many consecutive failures, stopping");
                return Err(Error::TooManyFailures(failures));
            }

            let envelope = match listener.get(cancel).await {
                Ok(envelope) => envelope,
                Err(e) if e.is_cancelled() => {
                    info!(queue = %self.queue_name, "Shutting down");
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    warn!(failures, error = %e, "Failed to fetch build job");
                    continue;
                }
            };

            match self.process(cancel, envelope).await {
                Outcome::Finished => failures = 0,
                Outcome::Failed => failures += 1,
                Outcome::Shutdown => {
                    info!(queue = %self.queue_name, "Shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn process(&self, cancel: &CancellationToken, envelope: Box<dyn Envelope>) -> Outcome {
        let job = match BuildJob::from_slice(envelope.body()) {
            Ok(job) => job,
            Err(e) => {
                // Redelivered forever: a body that does not parse now never will.
                warn!(
                    attempts = envelope.attempts(),
                    error = %e,
                    "Rejecting malformed build job with requeue"
                );
                acknowledged("reject", envelope.reject(true).await);
                return Outcome::Failed;
            }
        };

        info!(
            key = %job.key,
            owner = %job.owner,
            tag = %job.tag,
            hash = %job.hash,
            attempts = envelope.attempts(),
            "Received build job"
        );

        let result = self.run(cancel, &job).await;

        if cancel.is_cancelled() && result.is_err() {
            info!(key = %job.key, "Interrupted by shutdown, leaving job to the broker");
            return Outcome::Shutdown;
        }

        match result {
            Ok(()) => {
                info!(key = %job.key, tag = %job.tag, "Build job finished");
                acknowledged("finish", envelope.finish().await);
                Outcome::Finished
            }
            Err(e) if e.is_permanent() => {
                error!(key = %job.key, error = %e, "Discarding build job");
                acknowledged("reject", envelope.reject(false).await);
                Outcome::Failed
            }
            Err(e) => {
                warn!(key = %job.key, error = %e, "Build job failed, requeueing");
                acknowledged("reject", envelope.reject(true).await);
                Outcome::Failed
            }
        }
    }

    /// Run the handler under the per-job timeout. On expiry the job is
    /// cancelled and awaited so its cleanup completes before the next job.
    async fn run(&self, cancel: &CancellationToken, job: &BuildJob) -> Result<()> {
        let ctx = JobContext::new(cancel);
        let timeout = self.config.job_timeout;

        let run = self.handler.handle(&ctx, job);
        tokio::pin!(run);

        let result = match tokio::time::timeout(timeout, &mut run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %job.key, ?timeout, "Build job timed out, cancelling");
                ctx.expire();
                run.await
            }
        };

        match result {
            Err(e) if ctx.is_timed_out() && e.is_cancelled() => Err(Error::Timeout(format!(
                "build of {} exceeded {:?}",
                job.key, timeout
            ))),
            other => other,
        }
    }
}

fn acknowledged(action: &str, result: Result<()>) {
    match result {
        Ok(()) => debug!(action, "Acknowledged delivery"),
        Err(e) => warn!(action, error = %e, "Failed to acknowledge delivery"),
    }
}
