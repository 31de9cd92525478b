//! Job handler: runs the pipeline and reports build history.

use crate::listener::{JobContext, JobHandler};
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use pullr_core::{BuildJob, BuildLog, BuildRecord, BuildStatus, BuildStore, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Runs build jobs through a [`Pipeline`] and records each status
/// transition in the build store, when one is configured.
pub struct BuildHandler {
    pipeline: Arc<Pipeline>,
    store: Option<Arc<dyn BuildStore>>,
}

impl BuildHandler {
    pub fn new(pipeline: Arc<Pipeline>, store: Option<Arc<dyn BuildStore>>) -> Self {
        Self { pipeline, store }
    }

    /// Record that the build started. A missing image aborts the job; any
    /// other store failure only loses the history entry.
    async fn record_start(&self, job: &BuildJob, record: &BuildRecord) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        match store.update_build_record(&job.owner, &job.key, record).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                warn!(key = %job.key, error = %e, "Failed to record build start");
                Ok(())
            }
        }
    }

    async fn record_end(&self, job: &BuildJob, record: &BuildRecord) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.update_build_record(&job.owner, &job.key, record).await {
            warn!(
                key = %job.key,
                status = %record.status,
                error = %e,
                "Failed to record build result"
            );
        }
    }
}

#[async_trait]
impl JobHandler for BuildHandler {
    async fn handle(&self, ctx: &JobContext, job: &BuildJob) -> Result<()> {
        let secrets = std::iter::once(job.token.clone()).chain(self.pipeline.secrets());
        let log = BuildLog::with_secrets(secrets);

        let started = BuildRecord::started();
        self.record_start(job, &started).await?;
        log.system(format!(
            "Building {} at {} with {}",
            job.key,
            job.hash,
            self.pipeline.builder_name()
        ));

        let result = self.pipeline.run(ctx.token(), &log, job).await;

        if result.is_err() && ctx.is_shutting_down() {
            // The job goes back to the queue and will be recorded by its next run.
            return result;
        }

        let status = match &result {
            Ok(()) => BuildStatus::Succeeded,
            Err(e) if ctx.is_timed_out() || e.is_timeout() => BuildStatus::Timeout,
            Err(_) => BuildStatus::Failed,
        };
        if let Err(e) = &result {
            log.system(format!("Build {}: {}", status, log.redact(&e.to_string())));
        }
        info!(key = %job.key, status = %status, lines = log.len(), "Build completed");

        self.record_end(job, &started.finish(status, log.render()))
            .await;
        result
    }
}
