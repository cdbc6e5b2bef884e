use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::AdapterError;
use crate::vm_backend::{CommandOutput, VmBackend, VmHandle, VmSpec};

/// An in-memory VM backend fake. Assigns synthetic IPs from a private range
/// and echoes back a successful command result for any script, so engine and
/// pool tests can exercise the create/run/delete lifecycle without a
/// hypervisor.
#[derive(Default)]
pub struct MockVmBackend {
    next_octet: AtomicU32,
    live: Mutex<HashMap<String, VmHandle>>,
}

impl MockVmBackend {
    pub fn new() -> Self {
        Self {
            next_octet: AtomicU32::new(10),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().expect("mock vm backend lock poisoned").len()
    }
}

#[async_trait]
impl VmBackend for MockVmBackend {
    async fn create(&self, spec: VmSpec) -> Result<VmHandle, AdapterError> {
        let octet = self.next_octet.fetch_add(1, Ordering::SeqCst);
        let handle = VmHandle {
            name: spec.name.clone(),
            public_ip: format!("203.0.113.{octet}"),
            private_ip: format!("10.0.0.{octet}"),
        };
        self.live
            .lock()
            .expect("mock vm backend lock poisoned")
            .insert(spec.name, handle.clone());
        Ok(handle)
    }

    async fn delete(&self, vm_name: &str) -> Result<(), AdapterError> {
        self.live
            .lock()
            .expect("mock vm backend lock poisoned")
            .remove(vm_name);
        Ok(())
    }

    async fn run_command(&self, vm_name: &str, script: &str) -> Result<CommandOutput, AdapterError> {
        if !self.live.lock().expect("mock vm backend lock poisoned").contains_key(vm_name) {
            return Err(AdapterError::NotFound {
                adapter: "mock-vm".to_string(),
                what: vm_name.to_string(),
            });
        }
        Ok(CommandOutput {
            stdout: format!("ran {} bytes of script", script.len()),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn get_ips(&self, vm_name: &str) -> Result<(String, String), AdapterError> {
        let live = self.live.lock().expect("mock vm backend lock poisoned");
        let handle = live.get(vm_name).ok_or_else(|| AdapterError::NotFound {
            adapter: "mock-vm".to_string(),
            what: vm_name.to_string(),
        })?;
        Ok((handle.public_ip.clone(), handle.private_ip.clone()))
    }
}
