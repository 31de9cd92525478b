//! Scripted collaborators shared by the worker tests.

use async_trait::async_trait;
use pullr_config::{PipelineConfig, RegistryConfig};
use pullr_core::{
    BuildJob, BuildLog, BuildRequest, CloneRequest, Error, ImageBuilder, ImageBuilderFactory,
    PushRequest, Repository, RepositoryCloner, Result, Secret,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

pub fn job() -> BuildJob {
    BuildJob {
        owner: "acme".to_string(),
        key: "github:acme:app".to_string(),
        name: "app".to_string(),
        repository: Repository::new("github", "acme", "app"),
        dockerfile: String::new(),
        tag: "v1.2.0".to_string(),
        git_ref: "refs/heads/main".to_string(),
        hash: "abcd1234".to_string(),
        token: Secret::new("ghp_secret"),
        username: String::new(),
    }
}

pub fn pipeline_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        clone_dir: root.to_path_buf(),
        registry: RegistryConfig {
            url: "https://registry.example.com".to_string(),
            username: Some("pullr".to_string()),
            password: Some(Secret::new("registry-pass")),
        },
        git_bin: "git".to_string(),
    }
}

/// Cloner that writes a Dockerfile into the target, or fails like a
/// rejected credential.
#[derive(Default)]
pub struct FakeCloner {
    commits: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeCloner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl RepositoryCloner for FakeCloner {
    fn provider(&self) -> &str {
        "github"
    }

    fn clone_url(&self, repository: &Repository) -> String {
        format!("https://github.com/{}.git", repository.full_name())
    }

    async fn clone_repository(
        &self,
        _cancel: &CancellationToken,
        request: &CloneRequest<'_>,
        log: &BuildLog,
    ) -> Result<()> {
        self.commits.lock().unwrap().push(request.commit.to_string());
        if self.fail.load(Ordering::SeqCst) {
            log.stderr(format!(
                "fatal: Authentication failed for 'https://x:{}@github.com'",
                request.token.expose()
            ));
            return Err(Error::CommandFailed {
                program: "git".to_string(),
                code: Some(128),
                output: "Authentication failed".to_string(),
            });
        }
        std::fs::create_dir_all(request.target)?;
        std::fs::write(request.target.join("Dockerfile"), "FROM scratch\n")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fail {
    Clone,
    Create,
    Build,
    Push,
}

#[derive(Debug, Clone, Default)]
pub struct Events {
    pub builds: Vec<String>,
    pub pushes: Vec<String>,
    pub closes: usize,
}

#[derive(Default)]
struct Shared {
    events: Mutex<Events>,
    fail: Mutex<Option<Fail>>,
    not_found: AtomicBool,
    block_build: AtomicBool,
}

impl Shared {
    fn failure(&self, stage: Fail) -> Option<Error> {
        if *self.fail.lock().unwrap() != Some(stage) {
            return None;
        }
        if self.not_found.load(Ordering::SeqCst) {
            return Some(Error::NotFound("image github:acme:app".to_string()));
        }
        Some(Error::CommandFailed {
            program: "docker".to_string(),
            code: Some(1),
            output: format!("{:?} error", stage),
        })
    }
}

/// Factory whose builders record what they were asked to do.
#[derive(Default)]
pub struct FakeFactory {
    shared: Arc<Shared>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, stage: Fail) {
        *self.shared.fail.lock().unwrap() = Some(stage);
    }

    pub fn fail_with_not_found(&self) {
        self.fail(Fail::Build);
        self.shared.not_found.store(true, Ordering::SeqCst);
    }

    /// Make `build` wait until cancelled.
    pub fn block_build(&self) {
        self.shared.block_build.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Events {
        self.shared.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBuilderFactory for FakeFactory {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create(
        &self,
        _cancel: &CancellationToken,
        _log: &BuildLog,
    ) -> Result<Box<dyn ImageBuilder>> {
        if let Some(e) = self.shared.failure(Fail::Create) {
            return Err(e);
        }
        Ok(Box::new(FakeBuilder {
            shared: self.shared.clone(),
        }))
    }
}

struct FakeBuilder {
    shared: Arc<Shared>,
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        log: &BuildLog,
    ) -> Result<()> {
        assert!(request.workspace.join(&request.dockerfile).exists());
        if self.shared.block_build.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(Error::Cancelled);
        }
        if let Some(e) = self.shared.failure(Fail::Build) {
            return Err(e);
        }
        log.stdout(format!("Successfully tagged {}", request.local_tag));
        self.shared
            .events
            .lock()
            .unwrap()
            .builds
            .push(request.local_tag.clone());
        Ok(())
    }

    async fn push(
        &self,
        _cancel: &CancellationToken,
        request: &PushRequest,
        _log: &BuildLog,
    ) -> Result<()> {
        if let Some(e) = self.shared.failure(Fail::Push) {
            return Err(e);
        }
        self.shared
            .events
            .lock()
            .unwrap()
            .pushes
            .push(request.target.clone());
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.shared.events.lock().unwrap().closes += 1;
        Ok(())
    }
}
