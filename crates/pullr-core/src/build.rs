//! Build history and captured build output.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::secret::Secret;

/// Status of one build in the image's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    #[display("in_progress")]
    InProgress,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("timeout")]
    Timeout,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::InProgress)
    }
}

/// One entry of an image's build history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: BuildStatus,
    pub logs: String,
}

impl BuildRecord {
    /// A record for a build that just started.
    pub fn started() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            status: BuildStatus::InProgress,
            logs: String::new(),
        }
    }

    /// The same build, finished with `status`.
    pub fn finish(&self, status: BuildStatus, logs: String) -> Self {
        Self {
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
            status,
            logs,
        }
    }
}

/// A line of build output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Output sink for one pipeline run.
///
/// Clones share the same buffer. Every registered secret is redacted before a
/// line is stored.
#[derive(Debug, Clone, Default)]
pub struct BuildLog {
    lines: Arc<Mutex<Vec<LogLine>>>,
    secrets: Arc<Vec<Secret>>,
}

impl BuildLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that redacts `secrets` from everything written to it.
    pub fn with_secrets(secrets: impl IntoIterator<Item = Secret>) -> Self {
        Self {
            lines: Arc::default(),
            secrets: Arc::new(secrets.into_iter().filter(|s| !s.is_empty()).collect()),
        }
    }

    pub fn push(&self, stream: LogStream, content: impl AsRef<str>) {
        let content = self.redact(content.as_ref().trim_end());
        self.guard().push(LogLine {
            timestamp: Utc::now(),
            stream,
            content,
        });
    }

    pub fn system(&self, content: impl AsRef<str>) {
        self.push(LogStream::System, content);
    }

    pub fn stdout(&self, content: impl AsRef<str>) {
        self.push(LogStream::Stdout, content);
    }

    pub fn stderr(&self, content: impl AsRef<str>) {
        self.push(LogStream::Stderr, content);
    }

    /// Redact the registered secrets from `text`.
    pub fn redact(&self, text: &str) -> String {
        crate::secret::redact_all(text, self.secrets.iter())
    }

    pub fn lines(&self) -> Vec<LogLine> {
        self.guard().clone()
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    /// Render the captured output as plain text, one line per entry.
    pub fn render(&self) -> String {
        self.guard()
            .iter()
            .map(|line| match line.stream {
                LogStream::System => format!("==> {}", line.content),
                _ => line.content.clone(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn guard(&self) -> MutexGuard<'_, Vec<LogLine>> {
        // A panic while holding the lock cannot leave a Vec half-written.
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }
}
