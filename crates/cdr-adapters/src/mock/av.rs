use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;

use crate::av_engine::{AvEngine, AvOutcome};
use crate::error::AdapterError;
use crate::mock::cdr::THREAT_MARKER;

/// An in-memory AV engine fake.
///
/// Flags a file malicious if it still contains [`THREAT_MARKER`] (i.e. CDR
/// never ran or failed to strip it), or if its file name is in `always_flag`.
pub struct MockAvEngine {
    label: String,
    engine_version: String,
    always_flag: BTreeSet<String>,
}

impl MockAvEngine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            engine_version: "mock-1.0".to_string(),
            always_flag: BTreeSet::new(),
        }
    }

    pub fn always_flag(mut self, name: impl Into<String>) -> Self {
        self.always_flag.insert(name.into());
        self
    }
}

#[async_trait]
impl AvEngine for MockAvEngine {
    fn label(&self) -> &str {
        &self.label
    }

    async fn scan(&self, local_path: &Path) -> Result<AvOutcome, AdapterError> {
        let started = Instant::now();
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        let forced = self.always_flag.contains(&file_name);
        let bytes = tokio::fs::read(local_path).await.map_err(|e| AdapterError::Other {
            adapter: self.label.clone(),
            message: format!("reading {}: {e}", local_path.display()),
        })?;
        let contains_marker = bytes
            .windows(THREAT_MARKER.len().max(1))
            .any(|w| w == THREAT_MARKER);

        let is_malicious = forced || contains_marker;
        Ok(AvOutcome {
            is_malicious,
            threat_name: is_malicious.then(|| "Mock.Generic.ActiveContent".to_string()),
            confidence: if is_malicious { 92 } else { 0 },
            ms: started.elapsed().as_millis() as u64,
            engine_version: self.engine_version.clone(),
        })
    }
}
