//! `EdrConsole`: query alerts for a host within a time window (§4.1, §4.6, §6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AdapterError;

/// A single alert as reported by the vendor console.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AlertRecord {
    pub id: String,
    pub severity: String,
    pub threat_type: String,
    pub raw: serde_json::Value,
}

/// An EDR vendor console.
///
/// Implementations are responsible for paginating the underlying query if the
/// vendor API returns partial pages (§9 open question, resolved: pagination
/// is mandatory, not optional).
#[async_trait]
pub trait EdrConsole: Send + Sync {
    /// The console label used in unit results (e.g. `crowdstrike`).
    fn label(&self) -> &str;

    /// Fetch every alert raised for `host` within `[from, to]`, fully paginated.
    async fn get_alerts(
        &self,
        host: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>, AdapterError>;
}
