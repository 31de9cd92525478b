//! Worker configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode, KdlValue};
use pullr_core::{BUILD_QUEUE, RegistryAuth, Secret};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Time a worker may still need after a job times out to release its
/// builder and workspace before acknowledging the delivery.
pub const JOB_CLEANUP_SLACK: Duration = Duration::from_secs(60);

/// Process-wide worker configuration. Read-only after startup.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queue: QueueConfig,
    pub listener: ListenerConfig,
    pub pipeline: PipelineConfig,
    pub builder: BuilderConfig,
    /// Build history store. Without it, status transitions are only logged.
    pub store: Option<StoreConfig>,
}

/// Queue driver selection and connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Registered driver name ("postgres", "memory").
    pub driver: String,
    pub url: Option<String>,
    /// Queue to consume build jobs from.
    pub name: String,
    /// Fallback poll interval when no notification arrives.
    pub poll_interval: Duration,
    /// Age after which an unacknowledged delivery is handed out again.
    pub visibility_timeout: Duration,
}

/// Consumption loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    /// Consecutive failures after which the worker stops.
    pub max_errors: u32,
    /// Upper bound on one pipeline run.
    pub job_timeout: Duration,
    /// Delay between startup connection attempts.
    pub connect_interval: Duration,
    /// Give up connecting after this long.
    pub connect_timeout: Duration,
}

/// Static pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Root under which each run gets its own clone directory.
    pub clone_dir: PathBuf,
    pub registry: RegistryConfig,
    /// git executable used by the repository cloners.
    pub git_bin: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistryConfig {
    /// Registry host, e.g. "registry.example.com".
    pub url: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
}

impl RegistryConfig {
    /// Registry host without scheme or trailing slash, as used in image
    /// references.
    pub fn host(&self) -> &str {
        let url = self.url.trim_end_matches('/');
        url.strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .unwrap_or(url)
    }

    pub fn auth(&self) -> RegistryAuth {
        RegistryAuth {
            url: self.host().to_string(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Builder backend selection. Options are interpreted by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BuilderConfig {
    /// Registered backend name ("docker", "machine", "remote").
    pub driver: String,
    pub options: BTreeMap<String, String>,
    /// Repeated `option key="value"` entries, passed through to the backend.
    pub driver_options: Vec<(String, String)>,
}

impl BuilderConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            options: BTreeMap::new(),
            driver_options: Vec::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<String>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|s| s.as_str())
    }

    pub fn require(&self, key: &str) -> ConfigResult<&str> {
        self.get(key)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingField(self.field(key)))
    }

    pub fn get_u64(&self, key: &str) -> ConfigResult<Option<u64>> {
        self.get(key)
            .map(|v| {
                v.parse::<u64>()
                    .map_err(|_| ConfigError::invalid(self.field(key), "expected an integer"))
            })
            .transpose()
    }

    pub fn get_bool(&self, key: &str) -> ConfigResult<Option<bool>> {
        self.get(key)
            .map(|v| match v {
                "true" | "#true" => Ok(true),
                "false" | "#false" => Ok(false),
                _ => Err(ConfigError::invalid(self.field(key), "expected a boolean")),
            })
            .transpose()
    }

    /// A duration given in seconds.
    pub fn get_secs(&self, key: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.get_u64(key)?.map(Duration::from_secs))
    }

    fn field(&self, key: &str) -> String {
        format!("builder.{}.{}", self.driver, key)
    }
}

/// Build history store connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    pub url: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                driver: "postgres".to_string(),
                url: None,
                name: BUILD_QUEUE.to_string(),
                poll_interval: Duration::from_secs(5),
                visibility_timeout: Duration::from_secs(3600),
            },
            listener: ListenerConfig {
                max_errors: 5,
                job_timeout: Duration::from_secs(1800),
                connect_interval: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(60),
            },
            pipeline: PipelineConfig {
                clone_dir: std::env::temp_dir().join("pullr"),
                registry: RegistryConfig::default(),
                git_bin: "git".to_string(),
            },
            builder: BuilderConfig::new("docker"),
            store: None,
        }
    }
}

impl WorkerConfig {
    /// Check values that parse fine but cannot work together.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.queue.driver.is_empty() {
            return Err(ConfigError::MissingField("queue driver".to_string()));
        }
        if self.queue.name.is_empty() {
            return Err(ConfigError::MissingField("queue name".to_string()));
        }
        if self.queue.driver == "postgres" && self.queue.url.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::MissingField("queue url".to_string()));
        }
        if let Some(url) = &self.queue.url {
            url::Url::parse(url).map_err(|e| ConfigError::invalid("queue url", e.to_string()))?;
        }
        if self.queue.poll_interval.is_zero() {
            return Err(ConfigError::invalid("queue poll-interval", "must be greater than 0"));
        }

        if self.listener.max_errors == 0 {
            return Err(ConfigError::invalid("worker max-errors", "must be greater than 0"));
        }
        if self.listener.job_timeout.is_zero() {
            return Err(ConfigError::invalid("worker job-timeout", "must be greater than 0"));
        }
        if self.queue.visibility_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "queue visibility-timeout",
                "must be greater than 0",
            ));
        }
        let min_visibility = self.listener.job_timeout.checked_add(JOB_CLEANUP_SLACK);
        if min_visibility.is_none_or(|min| self.queue.visibility_timeout <= min) {
            return Err(ConfigError::invalid(
                "queue visibility-timeout",
                format!(
                    "must exceed worker job-timeout by more than {}s ({}s <= {}s + {}s)",
                    JOB_CLEANUP_SLACK.as_secs(),
                    self.queue.visibility_timeout.as_secs(),
                    self.listener.job_timeout.as_secs(),
                    JOB_CLEANUP_SLACK.as_secs()
                ),
            ));
        }
        if self.listener.connect_interval.is_zero() {
            return Err(ConfigError::invalid(
                "worker connect-interval",
                "must be greater than 0",
            ));
        }
        if self.listener.connect_timeout < self.listener.connect_interval {
            return Err(ConfigError::invalid(
                "worker connect-timeout",
                "must not be shorter than connect-interval",
            ));
        }

        if self.pipeline.clone_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("pipeline clone-dir".to_string()));
        }
        if self.pipeline.git_bin.is_empty() {
            return Err(ConfigError::MissingField("pipeline git-bin".to_string()));
        }
        if self.pipeline.registry.host().is_empty() {
            return Err(ConfigError::MissingField("pipeline registry".to_string()));
        }
        if self.pipeline.registry.host().contains('/') {
            return Err(ConfigError::invalid(
                "pipeline registry",
                "must be a host name without a path",
            ));
        }

        if self.builder.driver.is_empty() {
            return Err(ConfigError::MissingField("builder driver".to_string()));
        }

        if let Some(store) = &self.store {
            url::Url::parse(&store.url)
                .map_err(|e| ConfigError::invalid("store url", e.to_string()))?;
        }

        Ok(())
    }
}

/// Parse a worker configuration from KDL text. Unset values keep their
/// defaults.
pub fn parse_worker_config(kdl: &str) -> ConfigResult<WorkerConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = WorkerConfig::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        let name = node.name().value();
        if !seen.insert(name.to_string()) {
            return Err(ConfigError::Duplicate(name.to_string()));
        }

        match name {
            "queue" => parse_queue(node, &mut config.queue)?,
            "worker" => parse_listener(node, &mut config.listener)?,
            "pipeline" => parse_pipeline(node, &mut config.pipeline)?,
            "builder" => config.builder = parse_builder(node)?,
            "store" => config.store = Some(parse_store(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_queue(node: &KdlNode, queue: &mut QueueConfig) -> ConfigResult<()> {
    if let Some(driver) = get_first_string_arg(node) {
        queue.driver = driver;
    }

    for child in children(node) {
        match child.name().value() {
            "url" => queue.url = get_first_string_arg(child),
            "name" => {
                queue.name = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("queue name".to_string()))?;
            }
            "poll-interval" => queue.poll_interval = get_secs_arg(child, "queue poll-interval")?,
            "visibility-timeout" => {
                queue.visibility_timeout = get_secs_arg(child, "queue visibility-timeout")?;
            }
            _ => {}
        }
    }

    Ok(())
}

fn parse_listener(node: &KdlNode, listener: &mut ListenerConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "max-errors" => {
                let value = get_u64_arg(child, "worker max-errors")?;
                listener.max_errors = u32::try_from(value)
                    .map_err(|_| ConfigError::invalid("worker max-errors", "too large"))?;
            }
            "job-timeout" => listener.job_timeout = get_secs_arg(child, "worker job-timeout")?,
            "connect-interval" => {
                listener.connect_interval = get_secs_arg(child, "worker connect-interval")?;
            }
            "connect-timeout" => {
                listener.connect_timeout = get_secs_arg(child, "worker connect-timeout")?;
            }
            _ => {}
        }
    }

    Ok(())
}

fn parse_pipeline(node: &KdlNode, pipeline: &mut PipelineConfig) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "clone-dir" => {
                let dir = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("pipeline clone-dir".to_string()))?;
                pipeline.clone_dir = PathBuf::from(dir);
            }
            "git-bin" => {
                pipeline.git_bin = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("pipeline git-bin".to_string()))?;
            }
            "registry" => {
                pipeline.registry = RegistryConfig {
                    url: get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField("pipeline registry".to_string())
                    })?,
                    username: get_string_prop(child, "username"),
                    password: get_string_prop(child, "password").map(Secret::new),
                };
            }
            _ => {}
        }
    }

    Ok(())
}

fn parse_builder(node: &KdlNode) -> ConfigResult<BuilderConfig> {
    let driver = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("builder driver".to_string()))?;
    let mut builder = BuilderConfig::new(driver);

    for child in children(node) {
        let key = child.name().value();
        if key == "option" {
            for entry in child.entries() {
                if let Some(name) = entry.name() {
                    builder
                        .driver_options
                        .push((name.value().to_string(), value_to_string(entry.value())));
                }
            }
            continue;
        }

        let value = child
            .entries()
            .iter()
            .find(|e| e.name().is_none())
            .map(|e| value_to_string(e.value()))
            .ok_or_else(|| ConfigError::MissingField(format!("builder {}", key)))?;
        builder.options.insert(key.to_string(), value);
    }

    Ok(builder)
}

fn parse_store(node: &KdlNode) -> ConfigResult<StoreConfig> {
    let url = children(node)
        .find(|c| c.name().value() == "url")
        .and_then(get_first_string_arg)
        .ok_or_else(|| ConfigError::MissingField("store url".to_string()))?;
    Ok(StoreConfig { url })
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .map(|doc| doc.nodes())
        .unwrap_or_default()
        .iter()
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_u64_arg(node: &KdlNode, field: &str) -> ConfigResult<u64> {
    let value = node
        .entries()
        .iter()
        .find(|e| e.name().is_none())
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?
        .value();

    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::invalid(field, "expected a non-negative integer"))
}

fn get_secs_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    get_u64_arg(node, field).map(Duration::from_secs)
}

fn value_to_string(value: &KdlValue) -> String {
    if let Some(s) = value.as_string() {
        s.to_string()
    } else if let Some(i) = value.as_integer() {
        i.to_string()
    } else if let Some(f) = value.as_float() {
        f.to_string()
    } else if let Some(b) = value.as_bool() {
        b.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        queue "postgres" {
            url "postgres://pullr@localhost/pullr"
            name "builds"
            poll-interval 3
            visibility-timeout 1200
        }
        worker {
            max-errors 3
            job-timeout 900
            connect-interval 1
            connect-timeout 30
        }
        pipeline {
            clone-dir "/var/lib/pullr/src"
            registry "https://registry.example.com/" username="pullr" password="s3cret"
            git-bin "/usr/local/bin/git"
        }
        builder "machine" {
            driver "google"
            cpus 4
            memory 8192
            option google-project="ci" google-zone="europe-west1-b"
        }
        store {
            url "postgres://pullr@localhost/pullr"
        }
    "#;

    #[test]
    fn test_parse_full_config() {
        let config = parse_worker_config(FULL).unwrap();

        assert_eq!(config.queue.driver, "postgres");
        assert_eq!(config.queue.name, "builds");
        assert_eq!(config.queue.poll_interval, Duration::from_secs(3));
        assert_eq!(config.queue.visibility_timeout, Duration::from_secs(1200));
        assert_eq!(config.listener.max_errors, 3);
        assert_eq!(config.listener.job_timeout, Duration::from_secs(900));
        assert_eq!(
            config.pipeline.clone_dir,
            PathBuf::from("/var/lib/pullr/src")
        );
        assert_eq!(config.pipeline.registry.host(), "registry.example.com");
        assert_eq!(config.pipeline.git_bin, "/usr/local/bin/git");
        assert_eq!(
            config.pipeline.registry.password.as_ref().map(|p| p.expose()),
            Some("s3cret")
        );
        assert_eq!(config.builder.driver, "machine");
        assert_eq!(config.builder.get("driver"), Some("google"));
        assert_eq!(config.builder.get_u64("cpus").unwrap(), Some(4));
        assert_eq!(config.builder.driver_options.len(), 2);
        assert!(config.store.is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = parse_worker_config(
            r#"
            queue "memory"
            pipeline {
                registry "registry.example.com"
            }
            "#,
        )
        .unwrap();

        assert_eq!(config.queue.name, BUILD_QUEUE);
        assert_eq!(config.listener.max_errors, 5);
        assert_eq!(config.builder.driver, "docker");
        assert!(config.store.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_section_is_rejected() {
        let result = parse_worker_config("worker { max-errors 1 }\nworker { max-errors 2 }");
        assert!(matches!(result.unwrap_err(), ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_negative_duration_is_rejected() {
        let result = parse_worker_config("worker { job-timeout -5 }");
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = parse_worker_config(FULL).unwrap();
        assert!(config.validate().is_ok());

        config.listener.max_errors = 0;
        assert!(config.validate().is_err());
        config.listener.max_errors = 1;

        config.queue.url = None;
        assert!(config.validate().is_err());
        config.queue.driver = "memory".to_string();
        assert!(config.validate().is_ok());

        config.pipeline.registry.url = "registry.example.com/team".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_visibility_must_outlast_job() {
        let mut config = parse_worker_config(FULL).unwrap();

        config.listener.job_timeout = Duration::from_secs(3600);
        config.queue.visibility_timeout = Duration::from_secs(600);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("visibility-timeout"));

        // Equal to the job timeout plus cleanup time is still too short.
        config.queue.visibility_timeout = Duration::from_secs(3600) + JOB_CLEANUP_SLACK;
        assert!(config.validate().is_err());

        config.queue.visibility_timeout = Duration::from_secs(3661);
        assert!(config.validate().is_ok());

        config.queue.visibility_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("must be greater than 0"));
    }

    #[test]
    fn test_builder_option_types() {
        let builder = BuilderConfig::new("docker")
            .with_option("tls-verify", "true")
            .with_option("cpus", "many");

        assert_eq!(builder.get_bool("tls-verify").unwrap(), Some(true));
        assert!(builder.get_u64("cpus").is_err());
        assert!(builder.require("host").is_err());
        assert_eq!(builder.get_secs("boot-timeout").unwrap(), None);
    }
}
