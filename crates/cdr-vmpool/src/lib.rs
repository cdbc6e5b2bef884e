#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Bounded, recycled pool of detonation VMs, one sub-pool per EDR label (§4.2).

pub mod error;
pub mod health;
pub mod lease;
pub mod pool;

pub use error::VmPoolError;
pub use health::{LabelHealth, PoolHealth};
pub use lease::VmLease;
pub use pool::VmPool;
