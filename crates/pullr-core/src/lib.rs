//! Core domain types and traits for the pullr build worker.
//!
//! This crate contains:
//! - The build job payload and its validation
//! - Queue, listener and envelope traits (at-least-once delivery)
//! - Cloner and image builder capability traits
//! - Build history types and the build store trait
//! - Secrets and the shared error type

pub mod build;
pub mod builder;
pub mod error;
pub mod job;
pub mod queue;
pub mod secret;
pub mod store;

pub use build::{BuildLog, BuildRecord, BuildStatus, LogLine, LogStream};
pub use builder::{
    BuildRequest, CloneRequest, ImageBuilder, ImageBuilderFactory, PushRequest, RegistryAuth,
    RepositoryCloner, SourceRef,
};
pub use error::{Error, Result, Stage};
pub use job::{BUILD_QUEUE, BuildJob, Repository};
pub use queue::{Envelope, Listener, Queue};
pub use secret::Secret;
pub use store::BuildStore;
