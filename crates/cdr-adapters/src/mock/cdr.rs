use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;

use crate::cdr_engine::{CdrEngine, CdrOutcome, SanitizeStatus};
use crate::error::AdapterError;

/// The byte marker a fixture file uses to stand in for "active content" a
/// real CDR engine would strip.
pub(crate) const THREAT_MARKER: &[u8] = b"ACTIVE-CONTENT-MARKER";

/// An in-memory CDR engine fake.
///
/// Strips [`THREAT_MARKER`] occurrences from the input and writes the result
/// next to it with a `.sanitized` suffix. Paths whose file name is listed in
/// `fail_on` report a business failure instead, for exercising §4.4's
/// partial-failure path deterministically in tests.
pub struct MockCdrEngine {
    label: String,
    fail_on: BTreeSet<String>,
}

impl MockCdrEngine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            fail_on: BTreeSet::new(),
        }
    }

    /// Configure this engine to report `Failed` for any path ending in `name`.
    pub fn fail_on(mut self, name: impl Into<String>) -> Self {
        self.fail_on.insert(name.into());
        self
    }
}

#[async_trait]
impl CdrEngine for MockCdrEngine {
    fn label(&self) -> &str {
        &self.label
    }

    async fn sanitize(&self, local_path: &Path) -> Result<CdrOutcome, AdapterError> {
        let started = Instant::now();
        let file_name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if self.fail_on.contains(&file_name) {
            return Ok(CdrOutcome {
                status: SanitizeStatus::Failed,
                sanitized_path: None,
                ms: started.elapsed().as_millis() as u64,
                bytes_before: 0,
                bytes_after: 0,
                threats_found: 0,
                error: Some(format!("{} declined to sanitize {file_name}", self.label)),
            });
        }

        let original = tokio::fs::read(local_path).await.map_err(|e| AdapterError::Other {
            adapter: self.label.clone(),
            message: format!("reading {}: {e}", local_path.display()),
        })?;

        let threats_found = original
            .windows(THREAT_MARKER.len())
            .filter(|w| *w == THREAT_MARKER)
            .count() as u32;

        let sanitized: Vec<u8> = if threats_found == 0 {
            original.clone()
        } else {
            let mut out = Vec::with_capacity(original.len());
            let mut i = 0;
            while i < original.len() {
                if original[i..].starts_with(THREAT_MARKER) {
                    i += THREAT_MARKER.len();
                } else {
                    out.push(original[i]);
                    i += 1;
                }
            }
            out
        };

        let sanitized_path: PathBuf = local_path.with_extension("sanitized");
        tokio::fs::write(&sanitized_path, &sanitized)
            .await
            .map_err(|e| AdapterError::Other {
                adapter: self.label.clone(),
                message: format!("writing {}: {e}", sanitized_path.display()),
            })?;

        Ok(CdrOutcome {
            status: SanitizeStatus::Success,
            sanitized_path: Some(sanitized_path),
            ms: started.elapsed().as_millis() as u64,
            bytes_before: original.len() as u64,
            bytes_after: sanitized.len() as u64,
            threats_found,
            error: None,
        })
    }
}
