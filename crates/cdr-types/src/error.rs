//! Error taxonomy shared across the pipeline (§7 of the design).

/// Errors surfaced by the core crates (store, pool, planning).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The requested job does not exist (or has expired past its TTL).
    #[error("job {0} not found")]
    JobNotFound(crate::job::JobId),

    /// A job-store mutation was attempted on a job already in a terminal status.
    #[error("job {0} is already in a terminal status")]
    JobTerminal(crate::job::JobId),

    /// Planning rejected the request before any unit was dispatched.
    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    /// A VM could not be acquired before its timeout elapsed.
    #[error("timed out waiting for a VM for EDR label {0}")]
    VmAcquireTimeout(String),

    /// The underlying storage backend is unavailable.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration could not be parsed or was missing a required field.
    #[error("invalid configuration: {0}")]
    Config(String),
}
