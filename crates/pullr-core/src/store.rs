//! Build history storage abstraction.

use async_trait::async_trait;

use crate::Result;
use crate::build::BuildRecord;

/// Where build status transitions are reported.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Record the current state of the build of image `key` owned by `owner`.
    ///
    /// Fails with `Error::NotFound` when the image no longer exists.
    async fn update_build_record(
        &self,
        owner: &str,
        key: &str,
        record: &BuildRecord,
    ) -> Result<()>;
}
