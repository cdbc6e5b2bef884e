//! `BlobStore`: file fetch/put by container+path (§4.1, §6).

use std::path::Path;

use async_trait::async_trait;

use crate::error::AdapterError;

/// The blob-store gateway. Originals live at caller-supplied paths under a
/// container; sanitized artifacts are written to `post-cdr/<engine>/<path>`
/// in the same container (§6 "Blob layout").
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List blob paths under `container`, optionally filtered by `prefix`.
    async fn list(&self, container: &str, prefix: Option<&str>) -> Result<Vec<String>, AdapterError>;

    /// Download `container/path` to `dest`, returning the number of bytes written.
    async fn download(&self, container: &str, path: &str, dest: &Path) -> Result<u64, AdapterError>;

    /// Upload `local` to `container/path`.
    async fn upload(&self, container: &str, local: &Path, path: &str) -> Result<(), AdapterError>;
}

/// The blob path sanitized artifacts are written to (§6 "Blob layout").
pub fn post_cdr_path(cdr_engine: &str, original_path: &str) -> String {
    format!("post-cdr/{cdr_engine}/{original_path}")
}
