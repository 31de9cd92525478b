//! KDL configuration for the pullr build worker.
//!
//! This crate handles:
//! - Parsing the worker configuration file (pullr.kdl)
//! - `PULLR_*` environment overrides
//! - Validation of the resolved configuration

pub mod env;
pub mod error;
pub mod worker;

pub use error::{ConfigError, ConfigResult};
pub use worker::{
    BuilderConfig, ListenerConfig, PipelineConfig, QueueConfig, RegistryConfig, StoreConfig,
    WorkerConfig, parse_worker_config,
};

use std::path::Path;

/// Load the worker configuration.
///
/// Reads `path` when given (defaults otherwise), applies environment
/// overrides and validates the result.
pub fn load(path: Option<&Path>) -> ConfigResult<WorkerConfig> {
    let mut config = match path {
        Some(path) => parse_worker_config(&std::fs::read_to_string(path)?)?,
        None => WorkerConfig::default(),
    };
    env::apply_overrides(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}
