//! `VmBackend`: create / delete / run-command / fetch IPs (§4.1, §4.2, §6).

use async_trait::async_trait;

use crate::error::AdapterError;

/// Parameters for provisioning a fresh VM.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub edr_label: String,
    pub vm_size: Option<String>,
    pub subnet_id: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub base_image: Option<String>,
}

/// A freshly created (or queried) VM's network identity.
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub name: String,
    pub public_ip: String,
    pub private_ip: String,
}

/// Output of a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// The hypervisor/cloud backend that provisions and controls detonation VMs.
#[async_trait]
pub trait VmBackend: Send + Sync {
    /// Provision a new VM and block until the backend reports it ready.
    async fn create(&self, spec: VmSpec) -> Result<VmHandle, AdapterError>;

    /// Tear down a VM permanently.
    async fn delete(&self, vm_name: &str) -> Result<(), AdapterError>;

    /// Run a shell script on the VM (used for file copy, execution, and cleanup).
    async fn run_command(&self, vm_name: &str, script: &str) -> Result<CommandOutput, AdapterError>;

    /// Fetch the current public/private IPs for a VM.
    async fn get_ips(&self, vm_name: &str) -> Result<(String, String), AdapterError>;
}
