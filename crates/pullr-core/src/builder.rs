//! Capability traits for fetching sources and building images.
//!
//! A pipeline run resolves a [`RepositoryCloner`] by provider and gets a fresh
//! [`ImageBuilder`] from an [`ImageBuilderFactory`]; the builder never
//! outlives the run.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::build::BuildLog;
use crate::job::Repository;
use crate::secret::Secret;
use crate::Result;

/// What to check out and where.
#[derive(Debug, Clone)]
pub struct CloneRequest<'a> {
    pub repository: &'a Repository,
    /// Commit to check out; the branch head is never used.
    pub commit: &'a str,
    pub username: &'a str,
    pub token: &'a Secret,
    pub target: &'a Path,
}

/// Fetches a repository at a given commit.
#[async_trait]
pub trait RepositoryCloner: Send + Sync {
    /// Provider this cloner serves (e.g. "github").
    fn provider(&self) -> &str;

    /// Unauthenticated clone URL of `repository`.
    fn clone_url(&self, repository: &Repository) -> String;

    async fn clone_repository(
        &self,
        cancel: &CancellationToken,
        request: &CloneRequest<'_>,
        log: &BuildLog,
    ) -> Result<()>;
}

/// Where the sources of a build came from, for builders that fetch sources
/// themselves.
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub repository: Repository,
    pub clone_url: String,
    pub commit: String,
    pub username: String,
    pub token: Secret,
}

/// Input of [`ImageBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Directory holding the checked out sources.
    pub workspace: PathBuf,
    /// Dockerfile path relative to `workspace`.
    pub dockerfile: String,
    /// Run-unique local image reference.
    pub local_tag: String,
    /// Reference the image will be pushed as.
    pub target: String,
    pub owner: String,
    pub image_name: String,
    pub source: SourceRef,
}

/// Registry to push to.
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    /// Registry host, e.g. `registry.example.com`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
}

impl RegistryAuth {
    pub fn has_credentials(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
            && self.password.as_ref().is_some_and(|p| !p.is_empty())
    }
}

/// Input of [`ImageBuilder::push`].
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub local_tag: String,
    pub target: String,
    pub registry: RegistryAuth,
}

/// Builds and pushes images for exactly one pipeline run.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        log: &BuildLog,
    ) -> Result<()>;

    async fn push(
        &self,
        cancel: &CancellationToken,
        request: &PushRequest,
        log: &BuildLog,
    ) -> Result<()>;

    /// Release everything this builder provisioned. Consumes the builder.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Creates one [`ImageBuilder`] per pipeline run.
#[async_trait]
pub trait ImageBuilderFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Provision a builder. If provisioning fails, anything partially created
    /// is released before the error is returned.
    async fn create(
        &self,
        cancel: &CancellationToken,
        log: &BuildLog,
    ) -> Result<Box<dyn ImageBuilder>>;
}
