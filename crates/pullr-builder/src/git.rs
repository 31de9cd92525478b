//! Git-based repository cloners.

use crate::process::Cmd;
use async_trait::async_trait;
use pullr_config::PipelineConfig;
use pullr_core::{BuildLog, CloneRequest, Error, Repository, RepositoryCloner, Result, Secret};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_GIT_BIN: &str = "git";

/// Username used when a job carries a token but no username.
const TOKEN_USERNAME: &str = "x-access-token";

/// Checks out a single commit from a git hosting provider over HTTPS.
#[derive(Debug, Clone)]
pub struct GitCloner {
    provider: String,
    host: String,
    git_bin: String,
}

impl GitCloner {
    pub fn new(provider: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            host: host.into(),
            git_bin: DEFAULT_GIT_BIN.to_string(),
        }
    }

    pub fn github() -> Self {
        Self::new("github", "github.com")
    }

    pub fn gitlab() -> Self {
        Self::new("gitlab", "gitlab.com")
    }

    pub fn bitbucket() -> Self {
        Self::new("bitbucket", "bitbucket.org")
    }

    /// Use a specific git binary.
    pub fn with_binary(mut self, git_bin: impl Into<String>) -> Self {
        self.git_bin = git_bin.into();
        self
    }

    /// Clone URL with credentials embedded. Without a token the plain URL is
    /// returned.
    pub fn authenticated_url(
        &self,
        repository: &Repository,
        username: &str,
        token: &Secret,
    ) -> String {
        if token.is_empty() {
            return self.clone_url(repository);
        }
        let username = if username.is_empty() {
            TOKEN_USERNAME
        } else {
            username
        };
        format!(
            "https://{}:{}@{}/{}/{}.git",
            urlencoding::encode(username),
            urlencoding::encode(token.expose()),
            self.host,
            repository.owner,
            repository.name
        )
    }

    fn git(&self, request: &CloneRequest<'_>) -> Cmd {
        Cmd::new(&self.git_bin)
            .current_dir(request.target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .secret(request.token)
            .secret(&Secret::new(urlencoding::encode(request.token.expose())))
    }
}

#[async_trait]
impl RepositoryCloner for GitCloner {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn clone_url(&self, repository: &Repository) -> String {
        format!(
            "https://{}/{}/{}.git",
            self.host, repository.owner, repository.name
        )
    }

    async fn clone_repository(
        &self,
        cancel: &CancellationToken,
        request: &CloneRequest<'_>,
        log: &BuildLog,
    ) -> Result<()> {
        let repository = request.repository;
        info!(
            repository = %repository.full_name(),
            commit = %request.commit,
            target = %request.target.display(),
            "Cloning repository"
        );
        log.system(format!(
            "Cloning {} at {}",
            repository.full_name(),
            request.commit
        ));

        tokio::fs::create_dir_all(request.target).await?;

        let url = self.authenticated_url(repository, request.username, request.token);

        self.git(request)
            .args(["init", "--quiet"])
            .run(cancel, log)
            .await?;
        self.git(request)
            .args(["remote", "add", "origin"])
            .arg(url)
            .run(cancel, log)
            .await?;

        // Most hosts serve arbitrary reachable commits; fall back to a full
        // fetch for those that only serve refs.
        let shallow = self
            .git(request)
            .args(["fetch", "--quiet", "--depth", "1", "origin"])
            .arg(request.commit)
            .run(cancel, log)
            .await;
        match shallow {
            Ok(_) => {}
            Err(Error::CommandFailed { .. }) => {
                warn!(commit = %request.commit, "Shallow fetch failed, fetching full history");
                log.system("Shallow fetch failed, fetching full history");
                self.git(request)
                    .args(["fetch", "--quiet", "--tags", "origin"])
                    .run(cancel, log)
                    .await?;
            }
            Err(e) => return Err(e),
        }

        self.git(request)
            .args(["checkout", "--quiet", "--force"])
            .arg(request.commit)
            .run(cancel, log)
            .await?;

        Ok(())
    }
}

/// Cloners by provider name.
#[derive(Clone, Default)]
pub struct ClonerRegistry {
    cloners: BTreeMap<String, Arc<dyn RepositoryCloner>>,
}

impl ClonerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in hosting providers, cloning with the configured git binary.
    pub fn from_config(config: &PipelineConfig) -> Self {
        let git_bin = &config.git_bin;
        let mut registry = Self::new();
        for cloner in [GitCloner::github(), GitCloner::gitlab(), GitCloner::bitbucket()] {
            registry.register(Arc::new(cloner.with_binary(git_bin)));
        }
        registry
    }

    pub fn register(&mut self, cloner: Arc<dyn RepositoryCloner>) {
        self.cloners.insert(cloner.provider().to_string(), cloner);
    }

    /// Cloner for `provider`, or `Error::Unsupported`.
    pub fn get(&self, provider: &str) -> Result<Arc<dyn RepositoryCloner>> {
        self.cloners.get(provider).cloned().ok_or_else(|| {
            Error::Unsupported(format!("repository provider '{}'", provider))
        })
    }

    pub fn providers(&self) -> Vec<&str> {
        self.cloners.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ClonerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClonerRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
