//! Shared application state handed to every handler (§6, §10).

use std::sync::Arc;

use cdr_engine::Coordinator;
use cdr_store::JobStore;
use cdr_vmpool::VmPool;

/// Cloned into every request; every field is itself reference-counted so
/// cloning `AppState` is cheap.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<dyn JobStore>,
    pub vm_pool: Arc<VmPool>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, store: Arc<dyn JobStore>, vm_pool: Arc<VmPool>) -> Self {
        Self { coordinator, store, vm_pool }
    }
}
