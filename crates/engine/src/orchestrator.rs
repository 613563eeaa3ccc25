use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use metrics::{counter, histogram};
use regop_core::{ClusterClient, Context, ControlRegistry, InstanceRef, Snapshot};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CycleError, Stage};

/// Prefix of environment entries in reports, keeping them apart from resource keys.
const ENV_TARGET_PREFIX: &str = "env:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitOutcome {
    pub name: &'static str,
    pub drift: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushFailure {
    pub target: String,
    pub message: String,
}

/// What one cycle observed and wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub instance: InstanceRef,
    pub units: Vec<UnitOutcome>,
    pub flushed: Vec<String>,
    pub failures: Vec<FlushFailure>,
}

impl CycleReport {
    fn new(instance: InstanceRef) -> Self {
        Self { instance, units: Vec::new(), flushed: Vec::new(), failures: Vec::new() }
    }

    /// No unit detected drift.
    pub fn is_converged(&self) -> bool { self.units.iter().all(|u| !u.drift) }

    /// Writes attempted, successful or not.
    pub fn writes(&self) -> usize { self.flushed.len() + self.failures.len() }
}

/// Runs the registered control functions for one managed instance.
pub struct Orchestrator {
    client: Arc<dyn ClusterClient>,
    units: ControlRegistry,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn ClusterClient>, units: ControlRegistry) -> Self {
        Self { client, units }
    }

    pub fn units(&self) -> Vec<&'static str> { self.units.names() }

    pub async fn read_snapshot(&self, instance: &InstanceRef) -> Result<Snapshot> {
        self.client.read_snapshot(instance).await
    }

    /// Refresh the caches, run every unit in order, then flush dirty entries.
    ///
    /// Cancellation is honoured before the read, between units and before the
    /// flush; a cycle that stops early writes nothing.
    pub async fn run_cycle(
        &mut self,
        ctx: &mut Context,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let t0 = Instant::now();
        counter!("cycle_total", 1u64);
        let res = self.run_inner(ctx, cancel).await;
        histogram!("cycle_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(report) => debug!(instance = %report.instance, writes = report.writes(), "cycle complete"),
            Err(e) => {
                counter!("cycle_err", 1u64);
                warn!(instance = %e.instance(), error = %e, "cycle failed; will retry on next trigger");
            }
        }
        res
    }

    async fn run_inner(
        &mut self,
        ctx: &mut Context,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        let instance = ctx.instance().clone();
        let cancelled = |stage| CycleError::Cancelled { instance: instance.clone(), stage };

        if cancel.is_cancelled() {
            return Err(cancelled(Stage::Read));
        }
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(Stage::Read)),
            read = self.read_snapshot(&instance) => {
                read.map_err(|cause| CycleError::Read { instance: instance.clone(), cause })?
            }
        };
        ctx.refresh(snapshot)
            .map_err(|error| CycleError::Fatal { instance: instance.clone(), unit: "refresh", error })?;
        debug!(instance = %instance, cycle = ctx.cycle(), "caches seeded");

        let mut report = CycleReport::new(instance.clone());
        for unit in self.units.iter_mut() {
            let name = unit.describe();
            if cancel.is_cancelled() {
                return Err(cancelled(Stage::Unit(name)));
            }
            let fatal = |error| CycleError::Fatal { instance: instance.clone(), unit: name, error };
            unit.sense(ctx).map_err(fatal)?;
            let drift = unit.compare();
            if drift {
                counter!("drift_total", 1u64);
                info!(instance = %instance, unit = name, "drift detected");
                unit.respond(ctx).map_err(fatal)?;
            }
            report.units.push(UnitOutcome { name, drift });
        }

        if cancel.is_cancelled() {
            return Err(cancelled(Stage::Flush));
        }
        self.flush(ctx, &mut report).await;

        if report.failures.is_empty() {
            Ok(report)
        } else {
            Err(CycleError::Flush { report })
        }
    }

    /// Write every dirty entry once. Resources go first: the deployment is
    /// replaced at its observed version, and env patches would bump that version.
    async fn flush(&self, ctx: &mut Context, report: &mut CycleReport) {
        let instance = ctx.instance().clone();

        for key in ctx.resource_cache().dirty_keys() {
            let res = match ctx.resource_cache().get(&key) {
                Some(entry) => {
                    debug!(instance = %instance, key = %key, patches = ?entry.patches(), "flushing resource");
                    self.client.apply_resource(&instance, entry.value()).await
                }
                None => continue,
            };
            match res {
                Ok(written) => {
                    if let Some(entry) = ctx.resource_cache_mut().get_mut(&key) {
                        entry.settle(written);
                    }
                    counter!("flush_ok", 1u64);
                    report.flushed.push(key);
                }
                Err(e) => {
                    counter!("flush_err", 1u64);
                    warn!(instance = %instance, key = %key, error = %format!("{e:#}"), "resource write failed");
                    report.failures.push(FlushFailure { target: key, message: format!("{e:#}") });
                }
            }
        }

        for key in ctx.env_cache().dirty_keys() {
            let target = format!("{ENV_TARGET_PREFIX}{key}");
            let res = match ctx.env_cache().get(&key) {
                Some(entry) => self.client.apply_env(&instance, entry.value()).await,
                None => continue,
            };
            match res {
                Ok(written) => {
                    if let Some(entry) = ctx.env_cache_mut().get_mut(&key) {
                        entry.settle(written);
                    }
                    counter!("flush_ok", 1u64);
                    report.flushed.push(target);
                }
                Err(e) => {
                    counter!("flush_err", 1u64);
                    warn!(instance = %instance, key = %key, error = %format!("{e:#}"), "env write failed");
                    report.failures.push(FlushFailure { target, message: format!("{e:#}") });
                }
            }
        }

        if !report.flushed.is_empty() {
            info!(instance = %instance, written = ?report.flushed, failed = report.failures.len(), "flushed");
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").field("units", &self.units).finish()
    }
}
