//! VM pool record types (§3 "VM Record", §4.2).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a pooled detonation VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Provisioning,
    Available,
    InUse,
    Cleaning,
    Recycling,
    Deleted,
}

/// A single VM tracked by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub vm_name: String,
    pub edr_label: String,
    pub state: VmState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub use_count: u32,
    pub max_uses: u32,
}

impl VmRecord {
    pub fn new(vm_name: String, edr_label: String, max_uses: u32) -> Self {
        Self {
            vm_name,
            edr_label,
            state: VmState::Provisioning,
            public_ip: None,
            private_ip: None,
            created_at: Utc::now(),
            last_used_at: None,
            use_count: 0,
            max_uses,
        }
    }

    /// §4.2 release policy step 1: whether this VM has exhausted its uses.
    pub fn exhausted(&self) -> bool {
        self.use_count >= self.max_uses
    }
}
