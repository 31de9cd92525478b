//! Docker CLI image builder.
//!
//! Shells out to `docker` for build, tag, login and push. Engine selection
//! (`DOCKER_HOST` and TLS material) is set per command, so several builders
//! pointing at different engines can coexist in one process.

use crate::process::Cmd;
use async_trait::async_trait;
use pullr_config::{BuilderConfig, ConfigResult};
use pullr_core::{
    BuildLog, BuildRequest, ImageBuilder, ImageBuilderFactory, PushRequest, Result,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How to reach a Docker engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerSettings {
    pub binary: String,
    /// `DOCKER_HOST`; the CLI default when unset.
    pub host: Option<String>,
    pub cert_path: Option<PathBuf>,
    pub tls_verify: bool,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            host: None,
            cert_path: None,
            tls_verify: false,
        }
    }
}

impl DockerSettings {
    /// Read a `builder "docker"` block.
    pub fn from_config(config: &BuilderConfig) -> ConfigResult<Self> {
        let cert_path = config.get("cert-path").map(PathBuf::from);
        let tls_verify = config.get_bool("tls-verify")?.unwrap_or(cert_path.is_some());
        Ok(Self {
            binary: config.get("binary").unwrap_or("docker").to_string(),
            host: config.get("host").map(str::to_string),
            cert_path,
            tls_verify,
        })
    }

    /// Environment for every `docker` invocation.
    pub fn envs(&self) -> Vec<(String, String)> {
        let mut envs = Vec::new();
        if let Some(host) = &self.host {
            envs.push(("DOCKER_HOST".to_string(), host.clone()));
        }
        if self.tls_verify {
            envs.push(("DOCKER_TLS_VERIFY".to_string(), "1".to_string()));
        }
        if let Some(path) = &self.cert_path {
            envs.push((
                "DOCKER_CERT_PATH".to_string(),
                path.to_string_lossy().to_string(),
            ));
        }
        envs
    }

    fn engine(&self) -> &str {
        self.host.as_deref().unwrap_or("local engine")
    }
}

/// Builds with the Docker CLI against one engine.
#[derive(Debug, Clone)]
pub struct DockerCliBuilder {
    settings: DockerSettings,
}

impl DockerCliBuilder {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    fn docker(&self) -> Cmd {
        Cmd::new(&self.settings.binary).envs(&self.settings.envs())
    }

    /// Remove local references once pushed. Failures only leave disk usage
    /// behind, so they are logged and ignored.
    async fn remove_local(&self, request: &PushRequest, log: &BuildLog) {
        let result = self
            .docker()
            .args(["rmi", request.local_tag.as_str(), request.target.as_str()])
            .run(&CancellationToken::new(), log)
            .await;
        if let Err(e) = result {
            warn!(image = %request.local_tag, error = %e, "Failed to remove local image");
        }
    }
}

#[async_trait]
impl ImageBuilder for DockerCliBuilder {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        log: &BuildLog,
    ) -> Result<()> {
        let dockerfile = request.workspace.join(&request.dockerfile);
        info!(
            image = %request.local_tag,
            engine = %self.settings.engine(),
            "Building image"
        );

        self.docker()
            .args(["build", "--pull", "-t", request.local_tag.as_str(), "-f"])
            .arg(dockerfile.to_string_lossy())
            .arg(request.workspace.to_string_lossy())
            .run(cancel, log)
            .await?;
        Ok(())
    }

    async fn push(
        &self,
        cancel: &CancellationToken,
        request: &PushRequest,
        log: &BuildLog,
    ) -> Result<()> {
        self.docker()
            .args(["tag", request.local_tag.as_str(), request.target.as_str()])
            .run(cancel, log)
            .await?;

        let registry = &request.registry;
        if let (true, Some(username), Some(password)) = (
            registry.has_credentials(),
            registry.username.as_deref(),
            registry.password.as_ref(),
        ) {
            self.docker()
                .args(["login", "--username", username, "--password-stdin"])
                .arg(&registry.url)
                .stdin_secret(password)
                .run(cancel, log)
                .await?;
        }

        info!(image = %request.target, "Pushing image");
        self.docker()
            .args(["push", request.target.as_str()])
            .run(cancel, log)
            .await?;

        self.remove_local(request, log).await;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Hands out [`DockerCliBuilder`]s for a fixed engine.
#[derive(Debug, Clone)]
pub struct DockerFactory {
    settings: DockerSettings,
}

impl DockerFactory {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ImageBuilderFactory for DockerFactory {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn create(
        &self,
        _cancel: &CancellationToken,
        log: &BuildLog,
    ) -> Result<Box<dyn ImageBuilder>> {
        log.system(format!("Using docker at {}", self.settings.engine()));
        Ok(Box::new(DockerCliBuilder::new(self.settings.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBinary, build_request, push_request};
    use pullr_core::{Error, RegistryAuth, Secret};

    #[test]
    fn test_settings_from_config() {
        let config = BuilderConfig::new("docker")
            .with_option("host", "tcp://10.0.0.2:2376")
            .with_option("cert-path", "/etc/pullr/certs");
        let settings = DockerSettings::from_config(&config).unwrap();

        assert_eq!(settings.binary, "docker");
        assert!(settings.tls_verify);
        assert_eq!(
            settings.envs(),
            vec![
                ("DOCKER_HOST".to_string(), "tcp://10.0.0.2:2376".to_string()),
                ("DOCKER_TLS_VERIFY".to_string(), "1".to_string()),
                ("DOCKER_CERT_PATH".to_string(), "/etc/pullr/certs".to_string()),
            ]
        );
    }

    #[test]
    fn test_settings_default_engine() {
        let settings = DockerSettings::from_config(&BuilderConfig::new("docker")).unwrap();
        assert_eq!(settings, DockerSettings::default());
        assert!(settings.envs().is_empty());
    }

    #[test]
    fn test_settings_rejects_bad_bool() {
        let config = BuilderConfig::new("docker").with_option("tls-verify", "maybe");
        assert!(DockerSettings::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_build_invocation() {
        let fake = FakeBinary::new("docker", "");
        let builder = DockerCliBuilder::new(DockerSettings {
            binary: fake.path(),
            host: Some("tcp://engine:2376".to_string()),
            ..DockerSettings::default()
        });
        let request = build_request("/src/app_1");

        builder
            .build(&CancellationToken::new(), &request, &BuildLog::new())
            .await
            .unwrap();

        assert_eq!(
            fake.calls(),
            vec![format!(
                "build --pull -t {} -f /src/app_1/Dockerfile /src/app_1 [tcp://engine:2376]",
                request.local_tag
            )]
        );
    }

    #[tokio::test]
    async fn test_push_with_login() {
        let fake = FakeBinary::new("docker", "");
        let builder = DockerCliBuilder::new(DockerSettings {
            binary: fake.path(),
            ..DockerSettings::default()
        });
        let mut request = push_request();
        request.registry = RegistryAuth {
            url: "registry.example.com".to_string(),
            username: Some("pullr".to_string()),
            password: Some(Secret::new("s3cret")),
        };
        let log = BuildLog::with_secrets([Secret::new("s3cret")]);

        builder
            .push(&CancellationToken::new(), &request, &log)
            .await
            .unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[0].starts_with("tag "));
        assert_eq!(
            calls[1],
            "login --username pullr --password-stdin registry.example.com stdin=s3cret []"
        );
        assert!(calls[2].starts_with("push registry.example.com/acme/app:v1"));
        assert!(calls[3].starts_with("rmi "));
        assert!(!log.render().contains("s3cret"));
    }

    #[tokio::test]
    async fn test_push_without_credentials_skips_login() {
        let fake = FakeBinary::new("docker", "");
        let builder = DockerCliBuilder::new(DockerSettings {
            binary: fake.path(),
            ..DockerSettings::default()
        });

        builder
            .push(&CancellationToken::new(), &push_request(), &BuildLog::new())
            .await
            .unwrap();

        assert!(fake.calls().iter().all(|c| !c.starts_with("login")));
    }

    #[tokio::test]
    async fn test_failed_push_skips_cleanup() {
        let fake = FakeBinary::new("docker", r#"[ "$1" = "push" ] && exit 1"#);
        let builder = DockerCliBuilder::new(DockerSettings {
            binary: fake.path(),
            ..DockerSettings::default()
        });

        let err = builder
            .push(&CancellationToken::new(), &push_request(), &BuildLog::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandFailed { code: Some(1), .. }));
        assert!(fake.calls().iter().all(|c| !c.starts_with("rmi")));
    }

    /// Requires a running Docker engine.
    #[tokio::test]
    #[ignore]
    async fn test_build_scratch_image() {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::write(
            workspace.path().join("Dockerfile"),
            "FROM busybox\nRUN echo built\n",
        )
        .unwrap();
        let mut request = build_request(&workspace.path().to_string_lossy());
        request.local_tag = format!("pullr-test:{}", uuid::Uuid::new_v4().simple());

        let builder = DockerCliBuilder::new(DockerSettings::default());
        let log = BuildLog::new();
        builder
            .build(&CancellationToken::new(), &request, &log)
            .await
            .unwrap();

        assert!(log.render().contains("built"));
        let _ = Cmd::new("docker")
            .args(["rmi", request.local_tag.as_str()])
            .run(&CancellationToken::new(), &BuildLog::new())
            .await;
    }
}
