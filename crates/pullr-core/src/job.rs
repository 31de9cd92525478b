//! Build job payload carried on the queue.

use serde::{Deserialize, Serialize};

use crate::secret::Secret;
use crate::{Error, Result};

/// Name of the queue build jobs are published to.
pub const BUILD_QUEUE: &str = "pullr-image-build";

/// Source repository of an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Source control provider (e.g. "github").
    pub provider: String,
    /// Owner of the repository on the provider.
    pub owner: String,
    /// Repository name.
    pub name: String,
}

impl Repository {
    pub fn new(
        provider: impl Into<String>,
        owner: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// `owner/name` on the provider.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// A request to build one image at one commit and push it with one tag.
///
/// Created by the webhook handler; immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    /// User owning the image.
    pub owner: String,
    /// Image key, `provider:owner:name`.
    pub key: String,
    /// Human image name, used in the pushed reference.
    pub name: String,
    #[serde(rename = "repo")]
    pub repository: Repository,
    /// Dockerfile path relative to the repository root.
    #[serde(default)]
    pub dockerfile: String,
    /// Tag to push.
    pub tag: String,
    /// Git ref that triggered the build.
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    /// Commit to check out.
    pub hash: String,
    /// VCS token used to clone.
    #[serde(default)]
    pub token: Secret,
    /// VCS username used to clone.
    #[serde(default)]
    pub username: String,
}

impl BuildJob {
    /// Parse and validate a queue message body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let job: BuildJob = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidInput(format!("malformed build job: {}", e)))?;
        job.validate()?;
        Ok(job)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check that every field the pipeline depends on is present.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("owner", &self.owner),
            ("key", &self.key),
            ("name", &self.name),
            ("repo.provider", &self.repository.provider),
            ("repo.owner", &self.repository.owner),
            ("repo.name", &self.repository.name),
            ("tag", &self.tag),
            ("hash", &self.hash),
        ];

        if let Some((field, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(Error::InvalidInput(format!(
                "build job is missing '{}'",
                field
            )));
        }

        let segments = [
            ("repo.owner", &self.repository.owner),
            ("repo.name", &self.repository.name),
        ];
        if let Some((field, value)) = segments.iter().find(|(_, value)| !is_path_segment(value)) {
            return Err(Error::InvalidInput(format!(
                "{} must be a single path segment: {}",
                field, value
            )));
        }

        if self.dockerfile.starts_with('/') || self.dockerfile.split('/').any(|p| p == "..") {
            return Err(Error::InvalidInput(format!(
                "dockerfile path must stay inside the repository: {}",
                self.dockerfile
            )));
        }

        Ok(())
    }

    /// Dockerfile path, defaulting to `Dockerfile` at the repository root.
    pub fn dockerfile(&self) -> &str {
        if self.dockerfile.is_empty() {
            "Dockerfile"
        } else {
            &self.dockerfile
        }
    }
}

/// Repository owners and names end up in clone directories and image tags.
fn is_path_segment(value: &str) -> bool {
    value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> serde_json::Value {
        serde_json::json!({
            "owner": "acme",
            "key": "github:acme:app",
            "name": "app",
            "repo": { "provider": "github", "owner": "acme", "name": "app" },
            "dockerfile": "docker/Dockerfile",
            "tag": "v1.2.0",
            "ref": "refs/tags/v1.2.0",
            "hash": "abcd1234",
            "token": "secret-token",
            "username": "acme-bot"
        })
    }

    #[test]
    fn parses_wire_format() {
        let raw = serde_json::to_vec(&body()).unwrap();
        let job = BuildJob::from_slice(&raw).unwrap();

        assert_eq!(job.owner, "acme");
        assert_eq!(job.key, "github:acme:app");
        assert_eq!(job.repository, Repository::new("github", "acme", "app"));
        assert_eq!(job.git_ref, "refs/tags/v1.2.0");
        assert_eq!(job.hash, "abcd1234");
        assert_eq!(job.token.expose(), "secret-token");
        assert_eq!(job.dockerfile(), "docker/Dockerfile");
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let raw = serde_json::to_vec(&body()).unwrap();
        let job = BuildJob::from_slice(&raw).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&job.to_vec().unwrap()).unwrap();

        assert_eq!(value["repo"]["provider"], "github");
        assert_eq!(value["ref"], "refs/tags/v1.2.0");
        assert_eq!(value["token"], "secret-token");
    }

    #[test]
    fn rejects_truncated_body() {
        let raw = serde_json::to_vec(&body()).unwrap();
        let err = BuildJob::from_slice(&raw[..raw.len() / 2]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn rejects_missing_hash() {
        let mut value = body();
        value["hash"] = serde_json::json!("");
        let raw = serde_json::to_vec(&value).unwrap();
        let err = BuildJob::from_slice(&raw).unwrap_err();
        assert!(err.to_string().contains("hash"));
    }

    #[test]
    fn rejects_dockerfile_outside_repository() {
        let mut value = body();
        value["dockerfile"] = serde_json::json!("../../etc/Dockerfile");
        let raw = serde_json::to_vec(&value).unwrap();
        assert!(BuildJob::from_slice(&raw).is_err());
    }

    #[test]
    fn rejects_repository_name_outside_clone_root() {
        for name in ["../../outside", "..", "app/../../etc", "app\\..\\x"] {
            let mut value = body();
            value["repo"]["name"] = serde_json::json!(name);
            let raw = serde_json::to_vec(&value).unwrap();
            let err = BuildJob::from_slice(&raw).unwrap_err();
            assert!(err.to_string().contains("repo.name"), "{}", name);
        }
    }

    #[test]
    fn rejects_repository_owner_with_separator() {
        let mut value = body();
        value["repo"]["owner"] = serde_json::json!("acme/../..");
        let raw = serde_json::to_vec(&value).unwrap();
        let err = BuildJob::from_slice(&raw).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().contains("repo.owner"));
    }

    #[test]
    fn accepts_dotted_repository_name() {
        let mut value = body();
        value["repo"]["name"] = serde_json::json!("app.v2");
        let raw = serde_json::to_vec(&value).unwrap();
        assert!(BuildJob::from_slice(&raw).is_ok());
    }

    #[test]
    fn dockerfile_defaults_to_root() {
        let mut value = body();
        value["dockerfile"] = serde_json::json!("");
        let raw = serde_json::to_vec(&value).unwrap();
        let job = BuildJob::from_slice(&raw).unwrap();
        assert_eq!(job.dockerfile(), "Dockerfile");
    }
}
