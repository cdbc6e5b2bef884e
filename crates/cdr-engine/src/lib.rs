#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! The phase engine and phase-specific runners (§4.3–§4.6).

pub mod coordinator;
pub mod fan_out;
pub mod phase1;
pub mod phase2;
pub mod phase3;
pub mod plan;

pub use coordinator::{BatchJobRequest, Coordinator, CoordinatorDeps};
pub use fan_out::run_fan_out;
pub use phase1::{Phase1Deps, run_phase1};
pub use phase2::{Phase2Deps, run_phase2};
pub use phase3::{Phase3Deps, run_phase3};
pub use plan::{plan_files, PlannedFile};
