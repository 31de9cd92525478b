//! Ephemeral build machines provisioned with `docker-machine`.
//!
//! Every pipeline run gets its own machine. The machine is created when the
//! builder is requested and removed when the builder is closed, or right away
//! if provisioning fails part way.

use crate::docker::{DockerCliBuilder, DockerSettings};
use crate::process::Cmd;
use async_trait::async_trait;
use pullr_config::{BuilderConfig, ConfigError, ConfigResult};
use pullr_core::{
    BuildLog, BuildRequest, Error, ImageBuilder, ImageBuilderFactory, PushRequest, Result,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(300);
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Instance sizes as (name, vCPUs, memory in MB), smallest first.
const AMAZONEC2_SIZES: &[(&str, u64, u64)] = &[
    ("t3.micro", 2, 1024),
    ("t3.small", 2, 2048),
    ("t3.medium", 2, 4096),
    ("t3.large", 2, 8192),
    ("t3.xlarge", 4, 16384),
    ("t3.2xlarge", 8, 32768),
];

const DIGITALOCEAN_SIZES: &[(&str, u64, u64)] = &[
    ("s-1vcpu-1gb", 1, 1024),
    ("s-1vcpu-2gb", 1, 2048),
    ("s-2vcpu-2gb", 2, 2048),
    ("s-2vcpu-4gb", 2, 4096),
    ("s-4vcpu-8gb", 4, 8192),
    ("s-8vcpu-16gb", 8, 16384),
];

/// Smallest size that satisfies both requests.
fn smallest_fit(
    sizes: &[(&'static str, u64, u64)],
    cpus: u64,
    memory_mb: u64,
) -> Option<&'static str> {
    sizes
        .iter()
        .find(|(_, c, m)| *c >= cpus && *m >= memory_mb)
        .map(|(name, _, _)| *name)
}

/// Settings of a `builder "machine"` block.
#[derive(Debug, Clone)]
pub struct MachineSettings {
    pub binary: String,
    pub docker_binary: String,
    pub driver: String,
    pub cpus: Option<u64>,
    pub memory_mb: Option<u64>,
    pub storage_path: PathBuf,
    pub boot_timeout: Duration,
    pub poll_interval: Duration,
    /// Extra `--<key> <value>` flags passed to `create`.
    pub driver_options: Vec<(String, String)>,
}

impl MachineSettings {
    pub fn new(driver: impl Into<String>, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: "docker-machine".to_string(),
            docker_binary: "docker".to_string(),
            driver: driver.into(),
            cpus: None,
            memory_mb: None,
            storage_path: storage_path.into(),
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            poll_interval: STATUS_POLL_INTERVAL,
            driver_options: Vec::new(),
        }
    }

    pub fn from_config(config: &BuilderConfig) -> ConfigResult<Self> {
        let storage_path = match config.get("storage-path") {
            Some(path) => PathBuf::from(path),
            None => default_storage_path()?,
        };

        let mut settings = Self::new(config.require("driver")?, storage_path);
        if let Some(binary) = config.get("binary") {
            settings.binary = binary.to_string();
        }
        if let Some(binary) = config.get("docker-binary") {
            settings.docker_binary = binary.to_string();
        }
        settings.cpus = config.get_u64("cpus")?;
        settings.memory_mb = config.get_u64("memory")?;
        if let Some(timeout) = config.get_secs("boot-timeout")? {
            settings.boot_timeout = timeout;
        }
        settings.driver_options = config.driver_options.clone();

        settings
            .size_flags()
            .map_err(|message| ConfigError::invalid("builder.machine", message))?;
        Ok(settings)
    }

    /// Driver-specific flags for the requested CPU count and memory.
    fn size_flags(&self) -> std::result::Result<Vec<String>, String> {
        let (cpus, memory) = (self.cpus, self.memory_mb);
        let flags = match self.driver.as_str() {
            "virtualbox" => {
                let mut flags = Vec::new();
                if let Some(cpus) = cpus {
                    flags.extend(["--virtualbox-cpu-count".to_string(), cpus.to_string()]);
                }
                if let Some(memory) = memory {
                    flags.extend(["--virtualbox-memory".to_string(), memory.to_string()]);
                }
                flags
            }
            "google" => match (cpus, memory) {
                (None, None) => Vec::new(),
                _ => vec![
                    "--google-machine-type".to_string(),
                    format!("custom-{}-{}", cpus.unwrap_or(1), memory.unwrap_or(3840)),
                ],
            },
            "amazonec2" | "digitalocean" if cpus.is_none() && memory.is_none() => Vec::new(),
            "amazonec2" => {
                let size =
                    smallest_fit(AMAZONEC2_SIZES, cpus.unwrap_or(0), memory.unwrap_or(0))
                        .ok_or_else(|| "no amazonec2 instance type is large enough".to_string())?;
                vec!["--amazonec2-instance-type".to_string(), size.to_string()]
            }
            "digitalocean" => {
                let size =
                    smallest_fit(DIGITALOCEAN_SIZES, cpus.unwrap_or(0), memory.unwrap_or(0))
                        .ok_or_else(|| "no digitalocean size is large enough".to_string())?;
                vec!["--digitalocean-size".to_string(), size.to_string()]
            }
            _ => Vec::new(),
        };
        Ok(flags)
    }

    /// Arguments of `docker-machine create` for machine `name`.
    pub fn create_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--driver".to_string(),
            self.driver.clone(),
        ];
        match self.size_flags() {
            Ok(flags) => args.extend(flags),
            Err(message) => warn!(driver = %self.driver, "{}", message),
        }
        for (key, value) in &self.driver_options {
            args.push(format!("--{}", key));
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
        args.push(name.to_string());
        args
    }

    fn machine(&self) -> Cmd {
        Cmd::new(&self.binary).env(
            "MACHINE_STORAGE_PATH",
            self.storage_path.to_string_lossy(),
        )
    }

    /// Docker engine settings for machine `name`.
    fn docker_settings(&self, name: &str, url: &str) -> DockerSettings {
        DockerSettings {
            binary: self.docker_binary.clone(),
            host: Some(url.to_string()),
            cert_path: Some(self.storage_path.join("machines").join(name)),
            tls_verify: true,
        }
    }

    /// Stop (best-effort) and remove machine `name`. Runs even after
    /// cancellation.
    async fn remove(&self, name: &str, log: &BuildLog) -> Result<()> {
        let cancel = CancellationToken::new();
        if let Err(e) = self.machine().args(["stop", name]).run(&cancel, log).await {
            warn!(machine = %name, error = %e, "Failed to stop build machine");
        }
        self.machine()
            .args(["rm", "--force", "-y", name])
            .run(&cancel, log)
            .await?;
        info!(machine = %name, "Removed build machine");
        Ok(())
    }
}

fn default_storage_path() -> ConfigResult<PathBuf> {
    if let Ok(path) = std::env::var("MACHINE_STORAGE_PATH") {
        return Ok(PathBuf::from(path));
    }
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".docker").join("machine"))
        .map_err(|_| ConfigError::MissingField("builder.machine.storage-path".to_string()))
}

/// Provisions one machine per pipeline run.
#[derive(Debug, Clone)]
pub struct MachineFactory {
    settings: MachineSettings,
}

impl MachineFactory {
    pub fn new(settings: MachineSettings) -> Self {
        Self { settings }
    }

    /// Create a machine and wait until its engine can be addressed.
    pub async fn provision(
        &self,
        cancel: &CancellationToken,
        log: &BuildLog,
    ) -> Result<MachineBuilder> {
        let name = format!("pullr-{}", Uuid::new_v4().simple());
        info!(machine = %name, driver = %self.settings.driver, "Provisioning build machine");
        log.system(format!("Provisioning build machine {}", name));

        match self.start(cancel, &name, log).await {
            Ok(docker) => Ok(MachineBuilder {
                name,
                settings: self.settings.clone(),
                docker,
                log: log.clone(),
            }),
            Err(e) => {
                warn!(machine = %name, error = %e, "Provisioning failed, removing machine");
                if let Err(cleanup) = self.settings.remove(&name, log).await {
                    warn!(machine = %name, error = %cleanup, "Failed to remove build machine");
                }
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        cancel: &CancellationToken,
        name: &str,
        log: &BuildLog,
    ) -> Result<DockerCliBuilder> {
        let settings = &self.settings;
        settings
            .machine()
            .args(settings.create_args(name))
            .run(cancel, log)
            .await?;

        let deadline = Instant::now() + settings.boot_timeout;
        loop {
            let status = settings
                .machine()
                .args(["status", name])
                .quiet()
                .run(cancel, log)
                .await;
            match status {
                Ok(output) if output.first_line() == Some("Running") => break,
                Ok(_) => {}
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => warn!(machine = %name, error = %e, "Status check failed"),
            }

            if Instant::now() + settings.poll_interval > deadline {
                return Err(Error::Timeout(format!(
                    "machine {} not running after {:?}",
                    name, settings.boot_timeout
                )));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(settings.poll_interval) => {}
            }
        }

        let output = settings
            .machine()
            .args(["url", name])
            .quiet()
            .run(cancel, log)
            .await?;
        let url = output
            .first_line()
            .ok_or_else(|| Error::Internal(format!("machine {} reported no url", name)))?;

        log.system(format!("Build machine {} is running at {}", name, url));
        Ok(DockerCliBuilder::new(settings.docker_settings(name, url)))
    }
}

#[async_trait]
impl ImageBuilderFactory for MachineFactory {
    fn name(&self) -> &'static str {
        "machine"
    }

    async fn create(
        &self,
        cancel: &CancellationToken,
        log: &BuildLog,
    ) -> Result<Box<dyn ImageBuilder>> {
        Ok(Box::new(self.provision(cancel, log).await?))
    }
}

/// Docker CLI builder bound to a machine it owns.
#[derive(Debug)]
pub struct MachineBuilder {
    name: String,
    settings: MachineSettings,
    docker: DockerCliBuilder,
    log: BuildLog,
}

impl MachineBuilder {
    pub fn machine_name(&self) -> &str {
        &self.name
    }

    pub fn docker(&self) -> &DockerCliBuilder {
        &self.docker
    }
}

#[async_trait]
impl ImageBuilder for MachineBuilder {
    fn name(&self) -> &'static str {
        "machine"
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        request: &BuildRequest,
        log: &BuildLog,
    ) -> Result<()> {
        self.docker.build(cancel, request, log).await
    }

    async fn push(
        &self,
        cancel: &CancellationToken,
        request: &PushRequest,
        log: &BuildLog,
    ) -> Result<()> {
        self.docker.push(cancel, request, log).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.settings.remove(&self.name, &self.log).await
    }
}
