#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Persistent, concurrency-safe job metadata and per-phase result storage (§4.1).

pub mod error;
pub mod memory;
pub mod patch;
pub mod store;

pub use error::StoreError;
pub use memory::InMemoryJobStore;
pub use patch::JobPatch;
pub use store::JobStore;
