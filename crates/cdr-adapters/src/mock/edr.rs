use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::edr_console::{AlertRecord, EdrConsole};
use crate::error::AdapterError;

/// An in-memory EDR console fake keyed by host name.
///
/// Detonation tests seed alerts for a host with [`MockEdrConsole::raise`]
/// before the unit calls `get_alerts`, mirroring how a real console would
/// have already ingested telemetry from the agent during execution.
#[derive(Default)]
pub struct MockEdrConsole {
    label: String,
    alerts: Mutex<HashMap<String, Vec<AlertRecord>>>,
}

impl MockEdrConsole {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            alerts: Mutex::new(HashMap::new()),
        }
    }

    pub fn raise(&self, host: &str, alert: AlertRecord) {
        self.alerts
            .lock()
            .expect("mock edr console lock poisoned")
            .entry(host.to_string())
            .or_default()
            .push(alert);
    }
}

#[async_trait]
impl EdrConsole for MockEdrConsole {
    fn label(&self) -> &str {
        &self.label
    }

    async fn get_alerts(
        &self,
        host: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>, AdapterError> {
        Ok(self
            .alerts
            .lock()
            .expect("mock edr console lock poisoned")
            .get(host)
            .cloned()
            .unwrap_or_default())
    }
}
