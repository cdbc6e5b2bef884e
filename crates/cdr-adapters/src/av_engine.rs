//! `AvEngine`: scan a local file (§4.1, §6 adapter interfaces).

use std::path::Path;

use async_trait::async_trait;

use crate::error::AdapterError;

/// Result of `AvEngine::scan`.
#[derive(Debug, Clone)]
pub struct AvOutcome {
    pub is_malicious: bool,
    pub threat_name: Option<String>,
    pub confidence: u8,
    pub ms: u64,
    pub engine_version: String,
}

/// An antivirus engine.
#[async_trait]
pub trait AvEngine: Send + Sync {
    /// The engine label used in unit results (e.g. `defender`).
    fn label(&self) -> &str;

    /// Scan the file at `local_path` and return a verdict.
    async fn scan(&self, local_path: &Path) -> Result<AvOutcome, AdapterError>;
}
