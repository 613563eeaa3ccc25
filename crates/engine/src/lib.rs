//! Regop engine: drives Sense → Compare → Respond cycles and flushes the result.
//!
//! The orchestrator is the only component that talks to the cluster: one read
//! per resource kind before any control function runs, one write per dirty
//! cache entry after all of them ran.

#![forbid(unsafe_code)]

mod controller;
mod error;
pub mod memory;
mod orchestrator;

pub use controller::Controller;
pub use error::{CycleError, Stage};
pub use memory::{MemoryCluster, WriteRecord};
pub use orchestrator::{CycleReport, FlushFailure, Orchestrator, UnitOutcome};

pub use tokio_util::sync::CancellationToken;
