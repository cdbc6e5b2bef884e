use std::collections::BTreeSet;

use cdr_types::{Phase1Result, UnitStatus, Version};

/// A single file variant planned for Phase 2 or Phase 3 (§4.5, §4.6 — both
/// phases fan out over the same file plan).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub blob_path: String,
    pub version: Version,
    pub cdr_engine: Option<String>,
    pub original_path: String,
}

/// Reconstruct the unique-original-file plan from Phase 1's successes: one
/// pre-CDR unit per original file, plus one post-CDR unit per CDR engine
/// that sanitized it successfully.
pub fn plan_files(phase1_results: &[Phase1Result]) -> Vec<PlannedFile> {
    let originals: BTreeSet<&str> = phase1_results.iter().map(|r| r.original_blob_path.as_str()).collect();

    let mut plan = Vec::new();
    for original in originals {
        plan.push(PlannedFile {
            blob_path: original.to_string(),
            version: Version::PreCdr,
            cdr_engine: None,
            original_path: original.to_string(),
        });

        for result in phase1_results
            .iter()
            .filter(|r| r.original_blob_path == original && r.status == UnitStatus::Success)
        {
            if let Some(sanitized) = &result.sanitized_blob_path {
                plan.push(PlannedFile {
                    blob_path: sanitized.clone(),
                    version: Version::PostCdr,
                    cdr_engine: Some(result.cdr_engine.clone()),
                    original_path: original.to_string(),
                });
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn result(original: &str, engine: &str, status: UnitStatus, sanitized: Option<&str>) -> Phase1Result {
        Phase1Result {
            original_blob_path: original.to_string(),
            cdr_engine: engine.to_string(),
            sanitized_blob_path: sanitized.map(|s| s.to_string()),
            status,
            processing_millis: 10,
            bytes_before: 100,
            bytes_after: 90,
            threats_found: 1,
            error: None,
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    #[test]
    fn plans_one_pre_and_one_post_per_success() {
        let results = vec![
            result("a.pdf", "engine-a", UnitStatus::Success, Some("post-cdr/engine-a/a.pdf")),
            result("a.pdf", "engine-b", UnitStatus::Success, Some("post-cdr/engine-b/a.pdf")),
        ];
        let plan = plan_files(&results);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0].version, Version::PreCdr);
        assert!(plan.iter().filter(|f| f.version == Version::PostCdr).count() == 2);
    }

    #[test]
    fn failed_cdr_unit_produces_no_post_cdr_variant() {
        let results = vec![
            result("b.docx", "engine-a", UnitStatus::Success, Some("post-cdr/engine-a/b.docx")),
            result("b.docx", "engine-b", UnitStatus::Failed, None),
        ];
        let plan = plan_files(&results);
        // 1 pre + 1 post (engine-a only)
        assert_eq!(plan.len(), 2);
    }
}
