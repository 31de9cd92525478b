//! Error types for pullr.

use derive_more::Display;
use thiserror::Error;

/// A pipeline stage, used to label errors surfaced from a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    #[display("clone")]
    Clone,
    #[display("build")]
    Build,
    #[display("push")]
    Push,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("{program} exited with code {code:?}: {output}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        output: String,
    },

    #[error("remote build service: {0}")]
    Remote(String),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<Error>,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("giving up after {0} consecutive failures")]
    TooManyFailures(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an error with the stage it happened in.
    pub fn stage(stage: Stage, source: Error) -> Self {
        Error::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// The innermost error, skipping stage labels.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// The stage this error was raised in, if it was labelled.
    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout(_))
    }

    /// Retrying can never succeed: the referenced data is gone or the job
    /// asks for something this worker cannot do.
    pub fn is_permanent(&self) -> bool {
        matches!(self.root(), Error::NotFound(_) | Error::Unsupported(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_label_is_prefixed() {
        let err = Error::stage(Stage::Clone, Error::Internal("auth".to_string()));
        assert_eq!(err.to_string(), "clone failed: internal error: auth");
        assert_eq!(err.failed_stage(), Some(Stage::Clone));
    }

    #[test]
    fn classification_sees_through_stage_labels() {
        let err = Error::stage(
            Stage::Push,
            Error::stage(Stage::Build, Error::NotFound("image".to_string())),
        );
        assert!(err.is_not_found());
        assert!(err.is_permanent());
        assert!(!err.is_cancelled());

        let err = Error::stage(Stage::Build, Error::Cancelled);
        assert!(err.is_cancelled());
        assert!(!err.is_permanent());
    }

    #[test]
    fn unsupported_is_permanent() {
        assert!(Error::Unsupported("svn".to_string()).is_permanent());
        assert!(!Error::Queue("closed".to_string()).is_permanent());
    }
}
