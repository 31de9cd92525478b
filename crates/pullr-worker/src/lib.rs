//! Build worker for pullr.
//!
//! Consumes build jobs from a durable queue, one at a time, and runs each
//! through the image pipeline: clone the commit, build the image, push it to
//! the registry. Status transitions are written to the build history store.

pub mod handler;
pub mod listener;
pub mod pipeline;
pub mod store;

#[cfg(test)]
mod testing;

pub use handler::BuildHandler;
pub use listener::{BuildListener, JobContext, JobHandler};
pub use pipeline::{Pipeline, Workspace};
pub use store::{MemoryBuildStore, PgBuildStore};
