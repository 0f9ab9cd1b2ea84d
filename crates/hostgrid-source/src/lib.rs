//! hostgrid-source — materializes revision source code on the local host.
//!
//! Each revision is unpacked once into `<unpack_root>/<revision-dir>/app`.
//! Archives are kept under `<archive_dir>/<revision-dir>.zip` until the
//! revision is no longer referenced.

pub mod archive;
pub mod error;

use std::collections::HashSet;

use async_trait::async_trait;

use hostgrid_core::{RevisionKey, Runtime};

pub use archive::ArchiveSourceProvider;
pub use error::{SourceError, SourceResult};

#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Make sure the revision is unpacked locally. Concurrent calls for the
    /// same revision share one fetch.
    async fn ensure_source(
        &self,
        revision_key: &RevisionKey,
        source_url: &str,
        runtime: Runtime,
    ) -> SourceResult<()>;

    /// Remove every local revision not in `active`.
    async fn clean_old_revisions(&self, active: &HashSet<RevisionKey>) -> SourceResult<()>;
}
