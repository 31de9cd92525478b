//! Managed remote build service backend.
//!
//! The service fetches the sources itself, builds the image and pushes it to
//! the target reference. The worker only starts the build, polls it to a
//! terminal status and copies the service's logs into the run log.

use async_trait::async_trait;
use pullr_config::{BuilderConfig, ConfigError, ConfigResult};
use pullr_core::{
    BuildLog, BuildRequest, BuildStatus, Error, ImageBuilder, ImageBuilderFactory, PushRequest,
    Result, Secret,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_PROJECT_PREFIX: &str = "pullr-";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_POLL_ERRORS: u32 = 5;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PROJECT_NAME: usize = 255;

/// Build status reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Fault,
    Stopped,
    TimedOut,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    /// Final status of the run, or `None` while the build is still going.
    pub fn outcome(&self) -> Option<BuildStatus> {
        match self {
            RemoteStatus::Queued | RemoteStatus::InProgress => None,
            RemoteStatus::Succeeded => Some(BuildStatus::Succeeded),
            RemoteStatus::TimedOut => Some(BuildStatus::Timeout),
            RemoteStatus::Failed
            | RemoteStatus::Fault
            | RemoteStatus::Stopped
            | RemoteStatus::Unknown => Some(BuildStatus::Failed),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteStatus::Queued => "QUEUED",
            RemoteStatus::InProgress => "IN_PROGRESS",
            RemoteStatus::Succeeded => "SUCCEEDED",
            RemoteStatus::Failed => "FAILED",
            RemoteStatus::Fault => "FAULT",
            RemoteStatus::Stopped => "STOPPED",
            RemoteStatus::TimedOut => "TIMED_OUT",
            RemoteStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_type: Option<String>,
}

/// Input of [`BuildService::start_build`].
#[derive(Debug, Clone)]
pub struct StartBuild {
    pub source_location: String,
    pub source_version: String,
    pub source_username: String,
    pub source_token: Secret,
    pub dockerfile: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteBuild {
    pub id: String,
    pub status: RemoteStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogPage {
    #[serde(default)]
    pub events: Vec<LogEvent>,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    pub message: String,
}

/// Operations of the remote build service.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// `None` when the project does not exist.
    async fn get_project(&self, name: &str) -> Result<Option<Project>>;

    async fn create_project(&self, project: &Project) -> Result<Project>;

    async fn start_build(&self, project: &str, build: &StartBuild) -> Result<RemoteBuild>;

    async fn get_build(&self, id: &str) -> Result<RemoteBuild>;

    async fn get_logs(&self, id: &str, next_token: Option<&str>) -> Result<LogPage>;
}

/// [`BuildService`] over HTTPS with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpBuildService {
    endpoint: String,
    token: Secret,
    client: Client,
}

impl HttpBuildService {
    pub fn new(endpoint: impl Into<String>, token: Secret) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(endpoint, token, client))
    }

    pub fn with_client(endpoint: impl Into<String>, token: Secret, client: Client) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(Error::Remote(format!(
                "status {}: {}",
                status.as_u16(),
                error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Remote(format!("failed to parse response: {}", e)))
    }
}

fn request_error(e: reqwest::Error) -> Error {
    Error::Remote(e.without_url().to_string())
}

/// Await a service call unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = call => result,
    }
}

#[async_trait]
impl BuildService for HttpBuildService {
    async fn get_project(&self, name: &str) -> Result<Option<Project>> {
        let url = self.url(&format!("/projects/{}", urlencoding::encode(name)));
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .map_err(request_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::handle_response(response).await.map(Some)
    }

    async fn create_project(&self, project: &Project) -> Result<Project> {
        let response = self
            .client
            .post(self.url("/projects"))
            .bearer_auth(self.token.expose())
            .json(project)
            .send()
            .await
            .map_err(request_error)?;

        Self::handle_response(response).await
    }

    async fn start_build(&self, project: &str, build: &StartBuild) -> Result<RemoteBuild> {
        let url = self.url(&format!("/projects/{}/builds", urlencoding::encode(project)));
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose())
            .json(&StartBuildBody::from(build))
            .send()
            .await
            .map_err(request_error)?;

        Self::handle_response(response).await
    }

    async fn get_build(&self, id: &str) -> Result<RemoteBuild> {
        let url = self.url(&format!("/builds/{}", urlencoding::encode(id)));
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .map_err(request_error)?;

        Self::handle_response(response).await
    }

    async fn get_logs(&self, id: &str, next_token: Option<&str>) -> Result<LogPage> {
        let url = self.url(&format!("/builds/{}/logs", urlencoding::encode(id)));
        let mut request = self.client.get(&url).bearer_auth(self.token.expose());
        if let Some(token) = next_token {
            request = request.query(&[("next_token", token)]);
        }
        let response = request.send().await.map_err(request_error)?;

        Self::handle_response(response).await
    }
}

/// Wire form of [`StartBuild`]; the only place the source token is exposed.
#[derive(Serialize)]
struct StartBuildBody<'a> {
    source_location: &'a str,
    source_version: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    source_username: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    source_token: &'a str,
    dockerfile: &'a str,
    image: &'a str,
}

impl<'a> From<&'a StartBuild> for StartBuildBody<'a> {
    fn from(build: &'a StartBuild) -> Self {
        Self {
            source_location: &build.source_location,
            source_version: &build.source_version,
            source_username: &build.source_username,
            source_token: build.source_token.expose(),
            dockerfile: &build.dockerfile,
            image: &build.image,
        }
    }
}

/// Settings of a `builder "remote"` block.
#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub endpoint: String,
    pub token: Secret,
    pub project_prefix: String,
    pub compute_type: Option<String>,
    pub poll_interval: Duration,
    pub max_poll_errors: u32,
}

impl RemoteSettings {
    pub fn new(endpoint: impl Into<String>, token: Secret) -> Self {
        Self {
            endpoint: endpoint.into(),
            token,
            project_prefix: DEFAULT_PROJECT_PREFIX.to_string(),
            compute_type: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_errors: DEFAULT_MAX_POLL_ERRORS,
        }
    }

    pub fn from_config(config: &BuilderConfig) -> ConfigResult<Self> {
        let endpoint = config.require("endpoint")?;
        url::Url::parse(endpoint)
            .map_err(|e| ConfigError::invalid("builder.remote.endpoint", e.to_string()))?;

        let mut settings = Self::new(endpoint, Secret::new(config.require("token")?));
        if let Some(prefix) = config.get("project-prefix") {
            settings.project_prefix = prefix.to_string();
        }
        settings.compute_type = config.get("compute-type").map(str::to_string);
        if let Some(interval) = config.get_secs("poll-interval")? {
            settings.poll_interval = interval;
        }
        if let Some(max) = config.get_u64("max-poll-errors")? {
            settings.max_poll_errors = u32::try_from(max).unwrap_or(u32::MAX).max(1);
        }
        Ok(settings)
    }

    /// Remote project for images named `image` owned by `owner`.
    pub fn project_name(&self, owner: &str, image: &str) -> String {
        format!("{}{}-{}", self.project_prefix, owner, image)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .take(MAX_PROJECT_NAME)
            .collect()
    }
}

/// Runs one pipeline's build on the remote service.
pub struct RemoteBuilder {
    service: Arc<dyn BuildService>,
    settings: RemoteSettings,
    /// Target pushed by a succeeded remote build.
    pushed: Mutex<Option<String>>,
}

impl RemoteBuilder {
    pub fn new(service: Arc<dyn BuildService>, settings: RemoteSettings) -> Self {
        Self {
            service,
            settings,
            pushed: Mutex::new(None),
        }
    }

    async fn ensure_project(
        &self,
        cancel: &CancellationToken,
        name: &str,
        log: &BuildLog,
    ) -> Result<()> {
        if cancellable(cancel, self.service.get_project(name))
            .await?
            .is_some()
        {
            return Ok(());
        }

        info!(project = %name, "Creating remote build project");
        log.system(format!("Creating remote build project {}", name));
        let project = Project {
            name: name.to_string(),
            description: Some("Image builds managed by pullr".to_string()),
            compute_type: self.settings.compute_type.clone(),
        };
        cancellable(cancel, self.service.create_project(&project)).await?;
        Ok(())
    }

    /// Poll until the build reaches a terminal status.
    async fn wait(
        &self,
        cancel: &CancellationToken,
        started: RemoteBuild,
        log: &BuildLog,
    ) -> Result<RemoteStatus> {
        let mut build = started;
        let mut errors = 0u32;

        while build.status.outcome().is_none() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log.system(format!("Stopped waiting for remote build {}", build.id));
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            match cancellable(cancel, self.service.get_build(&build.id)).await {
                Err(Error::Cancelled) => {
                    log.system(format!("Stopped waiting for remote build {}", build.id));
                    return Err(Error::Cancelled);
                }
                Ok(current) => {
                    errors = 0;
                    if current.status != build.status {
                        log.system(format!("Remote build {} is {}", current.id, current.status));
                    }
                    build = current;
                }
                Err(e) => {
                    errors += 1;
                    warn!(build = %build.id, errors, error = %e, "Polling remote build failed");
                    if errors >= self.settings.max_poll_errors {
                        return Err(Error::Remote(format!(
                            "giving up on build {} after {} consecutive polling errors: {}",
                            build.id, errors, e
                        )));
                    }
                }
            }
        }

        Ok(build.status)
    }

    /// Copy every page of the service's logs. Missing logs do not fail the
    /// build.
    async fn copy_logs(&self, cancel: &CancellationToken, id: &str, log: &BuildLog) {
        let mut next_token: Option<String> = None;
        loop {
            let call = self.service.get_logs(id, next_token.as_deref());
            let page = match cancellable(cancel, call).await {
                Ok(page) => page,
                Err(Error::Cancelled) => {
                    log.system(format!("Stopped copying logs of remote build {}", id));
                    return;
                }
                Err(e) => {
                    warn!(build = %id, error = %e, "Failed to fetch remote build logs");
                    log.system(format!("Logs of remote build {} are incomplete", id));
                    return;
                }
            };
            for event in page.events {
                log.stdout(event.message);
            }
            match page.next_token {
                Some(token) if !token.is_empty() && next_token.as_deref() != Some(&token) => {
                    next_token = Some(token);
                }
                _ => return,
            }
        }
    }
}

#[async_trait]
impl ImageBuilder for RemoteBuilder {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        log: &BuildLog,
    ) -> Result<()> {
        let project = self
            .settings
            .project_name(&request.owner, &request.image_name);
        self.ensure_project(cancel, &project, log).await?;

        let source = &request.source;
        let start = StartBuild {
            source_location: source.clone_url.clone(),
            source_version: source.commit.clone(),
            source_username: source.username.clone(),
            source_token: source.token.clone(),
            dockerfile: request.dockerfile.clone(),
            image: request.target.clone(),
        };
        let started = cancellable(cancel, self.service.start_build(&project, &start)).await?;

        let id = started.id.clone();
        info!(project = %project, build = %id, "Started remote build");
        log.system(format!("Started remote build {} in project {}", id, project));

        let status = self.wait(cancel, started, log).await?;
        self.copy_logs(cancel, &id, log).await;
        debug!(build = %id, status = %status, "Remote build finished");

        match status.outcome() {
            Some(BuildStatus::Succeeded) => {
                *self.pushed.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(request.target.clone());
                Ok(())
            }
            Some(BuildStatus::Timeout) => {
                Err(Error::Timeout(format!("remote build {} timed out", id)))
            }
            _ => Err(Error::Remote(format!(
                "remote build {} finished with status {}",
                id, status
            ))),
        }
    }

    async fn push(
        &self,
        _cancel: &CancellationToken,
        request: &PushRequest,
        log: &BuildLog,
    ) -> Result<()> {
        let pushed = self.pushed.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if pushed.as_deref() != Some(request.target.as_str()) {
            return Err(Error::Remote(format!(
                "no succeeded remote build pushed {}",
                request.target
            )));
        }
        log.system(format!("Image {} was pushed by the remote build", request.target));
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Hands out [`RemoteBuilder`]s sharing one service client.
pub struct RemoteFactory {
    service: Arc<dyn BuildService>,
    settings: RemoteSettings,
}

impl RemoteFactory {
    pub fn new(settings: RemoteSettings) -> Result<Self> {
        let service = HttpBuildService::new(&settings.endpoint, settings.token.clone())?;
        Ok(Self::with_service(Arc::new(service), settings))
    }

    pub fn with_service(service: Arc<dyn BuildService>, settings: RemoteSettings) -> Self {
        Self { service, settings }
    }
}

#[async_trait]
impl ImageBuilderFactory for RemoteFactory {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn create(
        &self,
        _cancel: &CancellationToken,
        _log: &BuildLog,
    ) -> Result<Box<dyn ImageBuilder>> {
        Ok(Box::new(RemoteBuilder::new(
            self.service.clone(),
            self.settings.clone(),
        )))
    }
}
