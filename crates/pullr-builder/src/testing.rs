//! Test helpers: stand-in CLI binaries that record their invocations.

use pullr_core::{BuildRequest, PushRequest, RegistryAuth, Repository, Secret, SourceRef};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tempfile::TempDir;

/// A shell script posing as `name`. Each invocation appends
/// `<args> [stdin=<stdin> ][$DOCKER_HOST]` to a calls file; `prelude` runs
/// first and may print output or exit.
pub struct FakeBinary {
    dir: TempDir,
    name: String,
}

impl FakeBinary {
    pub fn new(name: &str, prelude: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let calls = dir.path().join("calls");
        let script = format!(
            r#"#!/bin/sh
stdin=""
if [ "$1" = "login" ]; then stdin="stdin=$(cat) "; fi
echo "$* ${{stdin}}[$DOCKER_HOST]" >> "{calls}"
{prelude}
exit 0
"#,
            calls = calls.display(),
        );
        let path = dir.path().join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            dir,
            name: name.to_string(),
        }
    }

    pub fn path(&self) -> String {
        self.dir.path().join(&self.name).to_string_lossy().to_string()
    }

    pub fn dir(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    /// Recorded invocations, oldest first.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("calls"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub fn build_request(workspace: &str) -> BuildRequest {
    let repository = Repository::new("github", "acme", "app");
    BuildRequest {
        workspace: PathBuf::from(workspace),
        dockerfile: "Dockerfile".to_string(),
        local_tag: "acme_acme_app_k3j9x2:v1".to_string(),
        target: "registry.example.com/acme/app:v1".to_string(),
        owner: "acme".to_string(),
        image_name: "app".to_string(),
        source: SourceRef {
            repository,
            clone_url: "https://github.com/acme/app.git".to_string(),
            commit: "abc123".to_string(),
            username: String::new(),
            token: Secret::new("ghp_token"),
        },
    }
}

pub fn push_request() -> PushRequest {
    PushRequest {
        local_tag: "acme_acme_app_k3j9x2:v1".to_string(),
        target: "registry.example.com/acme/app:v1".to_string(),
        registry: RegistryAuth {
            url: "registry.example.com".to_string(),
            username: None,
            password: None,
        },
    }
}
