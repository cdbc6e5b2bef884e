#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Capability interfaces the pipeline core depends on (§4.1, §6).
//!
//! Real CDR/AV/EDR/blob/VM integrations are out of scope for this repository
//! (§1); only the interfaces and a set of deterministic in-memory fakes live
//! here, the latter used by tests and local/demo runs (§10).

pub mod av_engine;
pub mod blob_store;
pub mod cdr_engine;
pub mod edr_console;
pub mod error;
pub mod mock;
pub mod vm_backend;

pub use av_engine::{AvEngine, AvOutcome};
pub use blob_store::BlobStore;
pub use cdr_engine::{CdrEngine, CdrOutcome, SanitizeStatus};
pub use edr_console::{AlertRecord, EdrConsole};
pub use error::AdapterError;
pub use vm_backend::{CommandOutput, VmBackend, VmHandle, VmSpec};
