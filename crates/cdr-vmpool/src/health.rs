use std::collections::BTreeMap;

use serde::Serialize;

/// Point-in-time view of one label's pool, used by `GET /api/health` (§10).
#[derive(Debug, Clone, Serialize)]
pub struct LabelHealth {
    pub configured_size: usize,
    pub tracked: usize,
    pub available: usize,
}

/// Snapshot across every configured EDR label.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolHealth {
    pub labels: BTreeMap<String, LabelHealth>,
}

impl PoolHealth {
    /// Healthy as long as every label has tracked at least one VM; an empty
    /// label (every provision attempt failed) signals a wedged pool.
    pub fn is_healthy(&self) -> bool {
        !self.labels.is_empty() && self.labels.values().all(|h| h.tracked > 0)
    }
}
