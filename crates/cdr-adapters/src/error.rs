//! Adapter-level error type (§7 "Adapter errors").

/// An error raised while talking to an external CDR/AV/EDR/blob/VM collaborator.
///
/// This is distinct from a *business* failure (e.g. a CDR engine declining to
/// sanitize a file) — those are represented in the outcome types themselves
/// via a status field, not as an `Err`.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("{adapter}: transport error: {message}")]
    Transport { adapter: String, message: String },

    #[error("{adapter}: timed out after {millis}ms")]
    Timeout { adapter: String, millis: u64 },

    #[error("{adapter}: not found: {what}")]
    NotFound { adapter: String, what: String },

    #[error("{adapter}: {message}")]
    Other { adapter: String, message: String },
}
