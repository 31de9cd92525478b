//! Source fetching and image build backends for pullr.
//!
//! Provides:
//! - Git cloners for the supported hosting providers
//! - Image builders: Docker CLI, ephemeral docker-machine VMs and a managed
//!   remote build service

pub mod docker;
pub mod git;
pub mod machine;
pub mod process;
pub mod remote;

#[cfg(test)]
mod testing;

pub use docker::{DockerCliBuilder, DockerFactory, DockerSettings};
pub use git::{ClonerRegistry, GitCloner};
pub use machine::{MachineBuilder, MachineFactory, MachineSettings};
pub use process::{Cmd, Output};
pub use remote::{BuildService, HttpBuildService, RemoteBuilder, RemoteFactory, RemoteSettings};

use pullr_config::{BuilderConfig, ConfigError};
use pullr_core::{Error, ImageBuilderFactory, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Constructor for an image builder backend.
pub type FactoryConstructor =
    Box<dyn Fn(&BuilderConfig) -> Result<Arc<dyn ImageBuilderFactory>> + Send + Sync>;

fn config_error(e: ConfigError) -> Error {
    Error::InvalidInput(e.to_string())
}

/// Maps backend names to constructors.
pub struct BuilderRegistry {
    backends: BTreeMap<String, FactoryConstructor>,
}

impl BuilderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: FactoryConstructor) {
        self.backends.insert(name.into(), constructor);
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(|k| k.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Build the factory for the backend named in `config`.
    pub fn create(&self, config: &BuilderConfig) -> Result<Arc<dyn ImageBuilderFactory>> {
        let constructor = self.backends.get(&config.driver).ok_or_else(|| {
            Error::Unsupported(format!(
                "builder '{}' (available: {})",
                config.driver,
                self.names().join(", ")
            ))
        })?;
        constructor(config)
    }
}

impl Default for BuilderRegistry {
    /// The built-in backends.
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(
            "docker",
            Box::new(|config: &BuilderConfig| {
                let settings = DockerSettings::from_config(config).map_err(config_error)?;
                Ok(Arc::new(DockerFactory::new(settings)) as Arc<dyn ImageBuilderFactory>)
            }),
        );
        registry.register(
            "machine",
            Box::new(|config: &BuilderConfig| {
                let settings = MachineSettings::from_config(config).map_err(config_error)?;
                Ok(Arc::new(MachineFactory::new(settings)) as Arc<dyn ImageBuilderFactory>)
            }),
        );
        registry.register(
            "remote",
            Box::new(|config: &BuilderConfig| {
                let settings = RemoteSettings::from_config(config).map_err(config_error)?;
                Ok(Arc::new(RemoteFactory::new(settings)?) as Arc<dyn ImageBuilderFactory>)
            }),
        );
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backends() {
        let registry = BuilderRegistry::default();
        assert_eq!(registry.names(), vec!["docker", "machine", "remote"]);
    }

    #[test]
    fn test_create_docker() {
        let registry = BuilderRegistry::default();
        let factory = registry.create(&BuilderConfig::new("docker")).unwrap();
        assert_eq!(factory.name(), "docker");
    }

    #[test]
    fn test_create_remote() {
        let registry = BuilderRegistry::default();
        let config = BuilderConfig::new("remote")
            .with_option("endpoint", "https://builds.example.com")
            .with_option("token", "t");
        assert_eq!(registry.create(&config).unwrap().name(), "remote");
    }

    #[test]
    fn test_invalid_backend_config() {
        let registry = BuilderRegistry::default();
        let err = registry.create(&BuilderConfig::new("remote")).err().unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_backend() {
        let registry = BuilderRegistry::default();
        let err = registry.create(&BuilderConfig::new("kaniko")).err().unwrap();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.to_string().contains("docker, machine, remote"));
    }
}
