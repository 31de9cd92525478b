//! Pipeline orchestrator: clone, build and push one image.

use pullr_builder::ClonerRegistry;
use pullr_config::PipelineConfig;
use pullr_core::{
    BuildJob, BuildLog, BuildRequest, CloneRequest, Error, ImageBuilder, ImageBuilderFactory,
    PushRequest, RepositoryCloner, Result, Secret, SourceRef, Stage,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Attempts at finding an unused workspace name.
const WORKSPACE_ATTEMPTS: usize = 5;

/// A clone directory owned by one run.
///
/// Removed explicitly with [`Workspace::remove`]; dropping it without
/// removing falls back to a blocking removal.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    /// Create a fresh `{name}_{suffix}` directory under `root`.
    async fn allocate(root: &Path, name: &str, mut suffix: impl FnMut() -> u32) -> Result<Self> {
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(Error::InvalidInput(format!(
                "workspace name must be a single path segment: {}",
                name
            )));
        }
        tokio::fs::create_dir_all(root).await?;

        let mut last_error = None;
        for _ in 0..WORKSPACE_ATTEMPTS {
            let path = root.join(format!("{}_{}", name, suffix()));
            match tokio::fs::create_dir(&path).await {
                Ok(()) => {
                    return Ok(Self {
                        path,
                        removed: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => last_error = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Internal(format!(
            "no free workspace for {} under {}: {}",
            name,
            root.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn remove(mut self) -> Result<()> {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Runs build jobs: one clone, one build and one push per job.
pub struct Pipeline {
    cloners: ClonerRegistry,
    factory: Arc<dyn ImageBuilderFactory>,
    config: PipelineConfig,
    rng: Mutex<StdRng>,
}

impl Pipeline {
    pub fn new(
        cloners: ClonerRegistry,
        factory: Arc<dyn ImageBuilderFactory>,
        config: PipelineConfig,
    ) -> Self {
        Self::with_rng(cloners, factory, config, StdRng::from_entropy())
    }

    /// Pipeline with deterministic workspace names and local tags.
    pub fn with_seed(
        cloners: ClonerRegistry,
        factory: Arc<dyn ImageBuilderFactory>,
        config: PipelineConfig,
        seed: u64,
    ) -> Self {
        Self::with_rng(cloners, factory, config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        cloners: ClonerRegistry,
        factory: Arc<dyn ImageBuilderFactory>,
        config: PipelineConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            cloners,
            factory,
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn builder_name(&self) -> &'static str {
        self.factory.name()
    }

    /// Credentials of the pipeline itself, to be masked in build logs.
    pub fn secrets(&self) -> Vec<Secret> {
        self.config.registry.password.iter().cloned().collect()
    }

    fn next_suffix(&self) -> u32 {
        self.rng.lock().unwrap_or_else(|e| e.into_inner()).r#gen()
    }

    /// Run-unique local reference:
    /// `{owner}_{repoOwner}_{repoName}_{suffix}:{tag}`.
    pub fn local_tag(job: &BuildJob, suffix: u32) -> String {
        let name = format!(
            "{}_{}_{}_{}",
            job.owner, job.repository.owner, job.repository.name, suffix
        );
        format!("{}:{}", name.to_lowercase(), job.tag)
    }

    /// Reference the image is pushed as: `{registry}/{owner}/{name}:{tag}`.
    /// Registries only accept lowercase repository paths.
    pub fn target(&self, job: &BuildJob) -> String {
        let repository = format!("{}/{}", job.owner, job.name);
        format!(
            "{}/{}:{}",
            self.config.registry.host(),
            repository.to_lowercase(),
            job.tag
        )
    }

    /// Run every stage of `job`. The workspace is removed and the builder is
    /// closed on every path out of this function.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        log: &BuildLog,
        job: &BuildJob,
    ) -> Result<()> {
        let cloner = self.cloners.get(&job.repository.provider)?;

        let workspace = Workspace::allocate(&self.config.clone_dir, &job.repository.name, || {
            self.next_suffix()
        })
        .await?;
        info!(
            key = %job.key,
            workspace = %workspace.path().display(),
            "Starting pipeline"
        );

        let result = self
            .run_in(cancel, log, job, cloner.as_ref(), workspace.path())
            .await;

        let path = workspace.path().to_path_buf();
        if let Err(e) = workspace.remove().await {
            warn!(workspace = %path.display(), error = %e, "Failed to remove workspace");
        }
        result
    }

    async fn run_in(
        &self,
        cancel: &CancellationToken,
        log: &BuildLog,
        job: &BuildJob,
        cloner: &dyn RepositoryCloner,
        workspace: &Path,
    ) -> Result<()> {
        let clone = CloneRequest {
            repository: &job.repository,
            commit: &job.hash,
            username: &job.username,
            token: &job.token,
            target: workspace,
        };
        cloner
            .clone_repository(cancel, &clone, log)
            .await
            .map_err(|e| Error::stage(Stage::Clone, e))?;

        let builder = self
            .factory
            .create(cancel, log)
            .await
            .map_err(|e| Error::stage(Stage::Build, e))?;

        let result = self
            .build_and_push(cancel, log, job, cloner, workspace, builder.as_ref())
            .await;

        if let Err(e) = builder.close().await {
            warn!(key = %job.key, error = %e, "Failed to release builder");
            log.system(format!("Failed to release builder: {}", e));
        }
        result
    }

    async fn build_and_push(
        &self,
        cancel: &CancellationToken,
        log: &BuildLog,
        job: &BuildJob,
        cloner: &dyn RepositoryCloner,
        workspace: &Path,
        builder: &dyn ImageBuilder,
    ) -> Result<()> {
        let local_tag = Self::local_tag(job, self.next_suffix());
        let target = self.target(job);

        let build = BuildRequest {
            workspace: workspace.to_path_buf(),
            dockerfile: job.dockerfile().to_string(),
            local_tag: local_tag.clone(),
            target: target.clone(),
            owner: job.owner.clone(),
            image_name: job.name.clone(),
            source: SourceRef {
                repository: job.repository.clone(),
                clone_url: cloner.clone_url(&job.repository),
                commit: job.hash.clone(),
                username: job.username.clone(),
                token: job.token.clone(),
            },
        };
        builder
            .build(cancel, &build, log)
            .await
            .map_err(|e| Error::stage(Stage::Build, e))?;

        let push = PushRequest {
            local_tag,
            target,
            registry: self.config.registry.auth(),
        };
        builder
            .push(cancel, &push, log)
            .await
            .map_err(|e| Error::stage(Stage::Push, e))?;

        info!(key = %job.key, image = %push.target, "Pushed image");
        log.system(format!("Pushed {}", push.target));
        Ok(())
    }
}
