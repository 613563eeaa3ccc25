use std::fmt;

use regop_core::{EngineError, InstanceRef};
use serde::Serialize;
use thiserror::Error;

use crate::orchestrator::CycleReport;

/// Where a cycle stopped when it was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Read,
    Unit(&'static str),
    Flush,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Read => f.write_str("read"),
            Stage::Unit(name) => write!(f, "unit {name}"),
            Stage::Flush => f.write_str("flush"),
        }
    }
}

/// Why a cycle did not complete cleanly. Every variant is retried by running the whole cycle again.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Cluster state could not be read; no control function ran and the caches were not touched.
    #[error("reading cluster state for {instance}: {cause:#}")]
    Read { instance: InstanceRef, cause: anyhow::Error },
    /// Cancelled between steps; nothing was written.
    #[error("cycle for {instance} cancelled before {stage}")]
    Cancelled { instance: InstanceRef, stage: Stage },
    /// A control function misused a cache key; nothing was written.
    #[error("{unit} failed for {instance}: {error}")]
    Fatal { instance: InstanceRef, unit: &'static str, #[source] error: EngineError },
    /// Some writes failed; the others were applied.
    #[error("{} of {} writes failed for {}", .report.failures.len(), .report.writes(), .report.instance)]
    Flush { report: CycleReport },
}

impl CycleError {
    pub fn instance(&self) -> &InstanceRef {
        match self {
            CycleError::Read { instance, .. }
            | CycleError::Cancelled { instance, .. }
            | CycleError::Fatal { instance, .. } => instance,
            CycleError::Flush { report } => &report.instance,
        }
    }

    pub fn is_cancelled(&self) -> bool { matches!(self, CycleError::Cancelled { .. }) }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleError::Flush { report } => Some(report),
            _ => None,
        }
    }
}
