use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cdr_adapters::{VmBackend, VmSpec};
use cdr_types::config::PoolConfig;
use cdr_types::vm::{VmRecord, VmState};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

use crate::error::VmPoolError;
use crate::health::{LabelHealth, PoolHealth};
use crate::lease::VmLease;

const CLEANUP_SCRIPT: &str = "cdr-validate-cleanup";
const PROVISION_ATTEMPTS: u32 = 3;

struct LabelPool {
    tx: mpsc::UnboundedSender<VmLease>,
    rx: Mutex<mpsc::UnboundedReceiver<VmLease>>,
    registry: Mutex<HashMap<String, VmRecord>>,
    next_suffix: AtomicU64,
}

/// A bounded, recycled pool of detonation VMs, one sub-pool per EDR label
/// (§4.2).
///
/// The per-label "available" queue is an unbounded mpsc channel: it gives us
/// FIFO-within-label ordering and a natural blocking-with-timeout `acquire`
/// via [`tokio::time::timeout`] around `recv`, with no separate condvar.
pub struct VmPool {
    config: PoolConfig,
    backend: Arc<dyn VmBackend>,
    labels: HashMap<String, LabelPool>,
}

impl VmPool {
    pub fn new(labels: &[String], config: PoolConfig, backend: Arc<dyn VmBackend>) -> Self {
        let labels = labels
            .iter()
            .map(|label| {
                let (tx, rx) = mpsc::unbounded_channel();
                (
                    label.clone(),
                    LabelPool {
                        tx,
                        rx: Mutex::new(rx),
                        registry: Mutex::new(HashMap::new()),
                        next_suffix: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        Self { config, backend, labels }
    }

    /// Concurrently provision `pool_size` VMs for every configured label.
    /// A VM that never provisions successfully is logged and skipped; the
    /// pool simply runs under its configured capacity (§4.2).
    pub async fn initialize(self: &Arc<Self>) {
        let mut tasks = JoinSet::new();
        for label in self.labels.keys().cloned() {
            for _ in 0..self.config.pool_size {
                let pool = Arc::clone(self);
                let label = label.clone();
                tasks.spawn(async move {
                    match pool.provision_one(&label).await {
                        Ok(record) => Some((label, record)),
                        Err(err) => {
                            tracing::warn!(edr_label = %label, error = %err, "vm provisioning failed, pool running under capacity");
                            None
                        }
                    }
                });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some((label, record))) => self.register_available(&label, record).await,
                Ok(None) => {}
                Err(err) => tracing::warn!(%err, "vm provisioning task panicked"),
            }
        }
    }

    async fn provision_one(&self, label: &str) -> Result<VmRecord, VmPoolError> {
        let pool = self.labels.get(label).ok_or_else(|| VmPoolError::UnknownLabel(label.to_string()))?;
        let suffix = pool.next_suffix.fetch_add(1, Ordering::SeqCst);
        let vm_name = format!("{label}-vm-{suffix}");

        let spec = VmSpec {
            name: vm_name.clone(),
            edr_label: label.to_string(),
            vm_size: self.config.vm_size.clone(),
            subnet_id: self.config.subnet_id.clone(),
            admin_username: self.config.admin_username.clone(),
            admin_password: self.config.admin_password.clone(),
            base_image: self.config.base_image.get(label).cloned(),
        };

        let mut last_err = None;
        for attempt in 1..=PROVISION_ATTEMPTS {
            match self.backend.create(spec.clone()).await {
                Ok(handle) => {
                    let mut record = VmRecord::new(handle.name, label.to_string(), self.config.max_uses);
                    record.state = VmState::Available;
                    record.public_ip = Some(handle.public_ip);
                    record.private_ip = Some(handle.private_ip);
                    return Ok(record);
                }
                Err(err) => {
                    tracing::debug!(edr_label = %label, attempt, error = %err, "vm provision attempt failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
        Err(VmPoolError::Backend(last_err.expect("loop runs at least once")))
    }

    async fn register_available(&self, label: &str, record: VmRecord) {
        let Some(pool) = self.labels.get(label) else { return };
        let lease = VmLease {
            vm_name: record.vm_name.clone(),
            edr_label: label.to_string(),
            public_ip: record.public_ip.clone().unwrap_or_default(),
            private_ip: record.private_ip.clone().unwrap_or_default(),
        };
        pool.registry.lock().await.insert(record.vm_name.clone(), record);
        let _ = pool.tx.send(lease);
    }

    /// Block until an `Available` VM exists for `label`, or the timeout
    /// elapses (§4.2).
    pub async fn acquire(&self, label: &str, timeout: Duration) -> Result<VmLease, VmPoolError> {
        let pool = self.labels.get(label).ok_or_else(|| VmPoolError::UnknownLabel(label.to_string()))?;
        let mut rx = pool.rx.lock().await;
        let lease = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return Err(VmPoolError::ShuttingDown),
            Err(_) => return Err(VmPoolError::AcquireTimeout(label.to_string())),
        };
        drop(rx);

        let mut registry = pool.registry.lock().await;
        if let Some(record) = registry.get_mut(&lease.vm_name) {
            record.state = VmState::InUse;
            record.last_used_at = Some(Utc::now());
            record.use_count += 1;
        }
        Ok(lease)
    }

    /// Return a VM to its label's pool, recycling or cleaning it per policy
    /// (§4.2 `release`).
    pub async fn release(&self, lease: VmLease, clean: bool) -> Result<(), VmPoolError> {
        let pool = self
            .labels
            .get(&lease.edr_label)
            .ok_or_else(|| VmPoolError::UnknownLabel(lease.edr_label.clone()))?;

        let exhausted = {
            let registry = pool.registry.lock().await;
            registry.get(&lease.vm_name).map(|r| r.exhausted()).unwrap_or(true)
        };

        if exhausted {
            self.recycle(&lease).await?;
            return Ok(());
        }

        if clean {
            {
                let mut registry = pool.registry.lock().await;
                if let Some(record) = registry.get_mut(&lease.vm_name) {
                    record.state = VmState::Cleaning;
                }
            }
            let clean_timeout = Duration::from_secs(self.config.clean_timeout_sec);
            let outcome = tokio::time::timeout(clean_timeout, self.backend.run_command(&lease.vm_name, CLEANUP_SCRIPT)).await;
            match outcome {
                Ok(Ok(output)) if output.succeeded() => {
                    let mut registry = pool.registry.lock().await;
                    if let Some(record) = registry.get_mut(&lease.vm_name) {
                        record.state = VmState::Available;
                    }
                    drop(registry);
                    let _ = pool.tx.send(lease);
                }
                _ => {
                    self.recycle(&lease).await?;
                }
            }
        } else {
            let mut registry = pool.registry.lock().await;
            if let Some(record) = registry.get_mut(&lease.vm_name) {
                record.state = VmState::Available;
            }
            drop(registry);
            let _ = pool.tx.send(lease);
        }
        Ok(())
    }

    async fn recycle(&self, lease: &VmLease) -> Result<(), VmPoolError> {
        let pool = self
            .labels
            .get(&lease.edr_label)
            .ok_or_else(|| VmPoolError::UnknownLabel(lease.edr_label.clone()))?;
        {
            let mut registry = pool.registry.lock().await;
            if let Some(record) = registry.get_mut(&lease.vm_name) {
                record.state = VmState::Recycling;
            }
        }
        if let Err(err) = self.backend.delete(&lease.vm_name).await {
            tracing::warn!(vm_name = %lease.vm_name, error = %err, "vm delete during recycle failed");
        }
        pool.registry.lock().await.remove(&lease.vm_name);

        match self.provision_one(&lease.edr_label).await {
            Ok(record) => self.register_available(&lease.edr_label, record).await,
            Err(err) => {
                tracing::warn!(edr_label = %lease.edr_label, error = %err, "replacement vm provisioning failed after recycle");
            }
        }
        Ok(())
    }

    /// Delete every tracked VM; pending `acquire` calls observe the channel
    /// close and return [`VmPoolError::ShuttingDown`] (§4.2 `shutdown`).
    pub async fn shutdown(&self) {
        for (label, pool) in &self.labels {
            pool.rx.lock().await.close();
            let mut registry = pool.registry.lock().await;
            for vm_name in registry.keys().cloned().collect::<Vec<_>>() {
                if let Err(err) = self.backend.delete(&vm_name).await {
                    tracing::warn!(edr_label = %label, vm_name = %vm_name, error = %err, "vm delete during shutdown failed");
                }
            }
            registry.clear();
        }
    }

    /// The backend this pool provisions through, exposed so phase runners can
    /// issue run-command calls against a leased VM directly (copy, execute).
    pub fn backend(&self) -> &Arc<dyn VmBackend> {
        &self.backend
    }

    pub async fn health(&self) -> PoolHealth {
        let mut labels = std::collections::BTreeMap::new();
        for (label, pool) in &self.labels {
            let registry = pool.registry.lock().await;
            let available = registry.values().filter(|r| r.state == VmState::Available).count();
            labels.insert(
                label.clone(),
                LabelHealth {
                    configured_size: self.config.pool_size,
                    tracked: registry.len(),
                    available,
                },
            );
        }
        PoolHealth { labels }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdr_adapters::mock::MockVmBackend;
    use cdr_types::config::PoolConfig;

    fn pool_with(pool_size: usize, max_uses: u32) -> Arc<VmPool> {
        let config = PoolConfig {
            pool_size,
            max_uses,
            ..PoolConfig::default()
        };
        Arc::new(VmPool::new(&["crowdstrike".to_string()], config, Arc::new(MockVmBackend::new())))
    }

    #[tokio::test]
    async fn acquire_after_initialize_returns_available_vm() {
        let pool = pool_with(1, 20);
        pool.initialize().await;

        let lease = pool.acquire("crowdstrike", Duration::from_secs(1)).await.unwrap();
        assert_eq!(lease.edr_label, "crowdstrike");
        pool.release(lease, false).await.unwrap();
    }

    #[tokio::test]
    async fn acquire_unknown_label_errors() {
        let pool = pool_with(1, 20);
        pool.initialize().await;
        let err = pool.acquire("defender", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, VmPoolError::UnknownLabel(_)));
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_exhausted() {
        let pool = pool_with(1, 20);
        pool.initialize().await;

        let lease = pool.acquire("crowdstrike", Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire("crowdstrike", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, VmPoolError::AcquireTimeout(_)));

        pool.release(lease, false).await.unwrap();
    }

    #[tokio::test]
    async fn release_recycles_once_max_uses_exhausted() {
        let pool = pool_with(1, 1);
        pool.initialize().await;

        let first = pool.acquire("crowdstrike", Duration::from_secs(1)).await.unwrap();
        let first_name = first.vm_name.clone();
        pool.release(first, false).await.unwrap();

        let second = pool.acquire("crowdstrike", Duration::from_secs(1)).await.unwrap();
        assert_ne!(second.vm_name, first_name);
        pool.release(second, false).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_the_queue() {
        let pool = pool_with(1, 20);
        pool.initialize().await;

        let lease = pool.acquire("crowdstrike", Duration::from_secs(1)).await.unwrap();
        pool.release(lease, false).await.unwrap();
        pool.shutdown().await;

        let err = pool.acquire("crowdstrike", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, VmPoolError::ShuttingDown));
    }

    #[tokio::test]
    async fn health_reports_tracked_and_available_counts() {
        let pool = pool_with(2, 20);
        pool.initialize().await;

        let health = pool.health().await;
        let label_health = &health.labels["crowdstrike"];
        assert_eq!(label_health.tracked, 2);
        assert_eq!(label_health.available, 2);
        assert!(health.is_healthy());
    }
}
