//! `CdrEngine`: sanitize a local file (§4.1, §6 adapter interfaces).

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::AdapterError;

/// Business outcome of a sanitize attempt, distinct from a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeStatus {
    Success,
    Failed,
}

/// Result of `CdrEngine::sanitize`.
#[derive(Debug, Clone)]
pub struct CdrOutcome {
    pub status: SanitizeStatus,
    pub sanitized_path: Option<PathBuf>,
    pub ms: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub threats_found: u32,
    pub error: Option<String>,
}

/// A Content Disarm & Reconstruction engine.
#[async_trait]
pub trait CdrEngine: Send + Sync {
    /// The engine label used in blob paths and unit results (e.g. `glasswall`).
    fn label(&self) -> &str;

    /// Sanitize the file at `local_path`, returning a local path to the
    /// sanitized artifact on success.
    async fn sanitize(&self, local_path: &Path) -> Result<CdrOutcome, AdapterError>;
}
