use cdr_types::{CoreError, JobId};

/// Errors raised by a [`crate::JobStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {0} is already in a terminal status")]
    Terminal(JobId),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::JobNotFound(id),
            StoreError::Terminal(id) => CoreError::JobTerminal(id),
            StoreError::Backend(msg) => CoreError::StoreUnavailable(msg),
        }
    }
}
