//! Environment variable overrides.

use crate::worker::{StoreConfig, WorkerConfig};
use crate::{ConfigError, ConfigResult};
use pullr_core::Secret;
use std::path::PathBuf;
use std::time::Duration;

/// Apply `PULLR_*` overrides, reading variables through `lookup`.
///
/// Expected variables (all optional):
/// - PULLR_QUEUE_URL, PULLR_QUEUE_NAME
/// - PULLR_MAX_ERRORS
/// - PULLR_JOB_TIMEOUT (seconds)
/// - PULLR_CLONE_DIR, PULLR_GIT_BIN
/// - PULLR_REGISTRY_URL, PULLR_REGISTRY_USERNAME, PULLR_REGISTRY_PASSWORD
/// - PULLR_STORE_URL
pub fn apply_overrides(
    config: &mut WorkerConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<()> {
    let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(url) = var("PULLR_QUEUE_URL") {
        config.queue.url = Some(url);
    }
    if let Some(name) = var("PULLR_QUEUE_NAME") {
        config.queue.name = name;
    }
    if let Some(value) = var("PULLR_MAX_ERRORS") {
        config.listener.max_errors = value
            .parse()
            .map_err(|_| ConfigError::env("PULLR_MAX_ERRORS", "expected an integer"))?;
    }
    if let Some(value) = var("PULLR_JOB_TIMEOUT") {
        let secs: u64 = value
            .parse()
            .map_err(|_| ConfigError::env("PULLR_JOB_TIMEOUT", "expected seconds"))?;
        config.listener.job_timeout = Duration::from_secs(secs);
    }
    if let Some(dir) = var("PULLR_CLONE_DIR") {
        config.pipeline.clone_dir = PathBuf::from(dir);
    }
    if let Some(git_bin) = var("PULLR_GIT_BIN") {
        config.pipeline.git_bin = git_bin;
    }
    if let Some(url) = var("PULLR_REGISTRY_URL") {
        config.pipeline.registry.url = url;
    }
    if let Some(username) = var("PULLR_REGISTRY_USERNAME") {
        config.pipeline.registry.username = Some(username);
    }
    if let Some(password) = var("PULLR_REGISTRY_PASSWORD") {
        config.pipeline.registry.password = Some(Secret::new(password));
    }
    if let Some(url) = var("PULLR_STORE_URL") {
        config.store = Some(StoreConfig { url });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = WorkerConfig::default();
        apply_overrides(
            &mut config,
            lookup(&[
                ("PULLR_QUEUE_URL", "postgres://db/pullr"),
                ("PULLR_MAX_ERRORS", "9"),
                ("PULLR_JOB_TIMEOUT", "60"),
                ("PULLR_GIT_BIN", "/opt/git/bin/git"),
                ("PULLR_REGISTRY_URL", "registry.example.com"),
                ("PULLR_REGISTRY_PASSWORD", "pw"),
                ("PULLR_STORE_URL", "postgres://db/pullr"),
            ]),
        )
        .unwrap();

        assert_eq!(config.queue.url.as_deref(), Some("postgres://db/pullr"));
        assert_eq!(config.listener.max_errors, 9);
        assert_eq!(config.listener.job_timeout, Duration::from_secs(60));
        assert_eq!(config.pipeline.git_bin, "/opt/git/bin/git");
        assert_eq!(config.pipeline.registry.url, "registry.example.com");
        assert_eq!(
            config.pipeline.registry.password,
            Some(Secret::new("pw"))
        );
        assert!(config.store.is_some());
    }

    #[test]
    fn test_empty_values_are_ignored() {
        let mut config = WorkerConfig::default();
        apply_overrides(&mut config, lookup(&[("PULLR_QUEUE_NAME", "")])).unwrap();
        assert_eq!(config.queue.name, pullr_core::BUILD_QUEUE);
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let mut config = WorkerConfig::default();
        let err = apply_overrides(&mut config, lookup(&[("PULLR_MAX_ERRORS", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "PULLR_MAX_ERRORS"));
    }
}
