use cdr_adapters::AdapterError;

/// Errors raised by the VM pool (§4.2, §7 "Resource errors").
#[derive(Debug, thiserror::Error)]
pub enum VmPoolError {
    #[error("no pool configured for EDR label {0}")]
    UnknownLabel(String),

    #[error("timed out waiting for a VM for EDR label {0}")]
    AcquireTimeout(String),

    #[error("vm backend error: {0}")]
    Backend(#[from] AdapterError),

    #[error("vm pool is shutting down")]
    ShuttingDown,
}
