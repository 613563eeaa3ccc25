use std::sync::{Arc, Mutex};

use regop_core::{ClusterClient, Context, ControlRegistry, EngineError, InstanceRef};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::CycleError;
use crate::orchestrator::{CycleReport, Orchestrator};

type UnitFactory = dyn Fn() -> Result<ControlRegistry, EngineError> + Send + Sync;

struct Slot {
    orchestrator: Orchestrator,
    context: Context,
}

/// Per-instance cycle driver.
///
/// Each managed instance gets its own context and control functions behind an
/// async lock: triggers for the same instance run one after another, different
/// instances run independently.
pub struct Controller {
    client: Arc<dyn ClusterClient>,
    units: Arc<UnitFactory>,
    slots: Mutex<FxHashMap<InstanceRef, Arc<tokio::sync::Mutex<Slot>>>>,
}

impl Controller {
    /// `units` is called once per new instance. It is called once here as well so a
    /// broken registry is reported at startup.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        units: impl Fn() -> Result<ControlRegistry, EngineError> + Send + Sync + 'static,
    ) -> Result<Self, EngineError> {
        let names = units()?.names();
        debug!(units = ?names, "controller ready");
        Ok(Self { client, units: Arc::new(units), slots: Mutex::new(FxHashMap::default()) })
    }

    /// Run one cycle for `instance`, waiting for an in-flight cycle of the same instance to finish first.
    pub async fn trigger(
        &self,
        instance: &InstanceRef,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        loop {
            let slot = self.slot(instance)?;
            let mut guard = slot.lock().await;
            // A slot forgotten while we waited is detached; start over on the current one.
            if !self.is_current(instance, &slot) {
                continue;
            }
            let Slot { orchestrator, context } = &mut *guard;
            return orchestrator.run_cycle(context, cancel).await;
        }
    }

    /// Drop the state of an instance that is no longer managed. A busy instance
    /// is kept; returns whether the state was dropped.
    pub fn forget(&self, instance: &InstanceRef) -> bool {
        let mut slots = self.lock_slots();
        let idle = slots.get(instance).map_or(false, |s| s.try_lock().is_ok());
        if idle {
            slots.remove(instance);
        }
        idle
    }

    pub fn instances(&self) -> Vec<InstanceRef> {
        let mut out: Vec<_> = self.lock_slots().keys().cloned().collect();
        out.sort();
        out
    }

    /// Whether a cycle for `instance` is running right now.
    pub fn is_busy(&self, instance: &InstanceRef) -> bool {
        self.lock_slots().get(instance).map(|s| s.try_lock().is_err()).unwrap_or(false)
    }

    fn is_current(&self, instance: &InstanceRef, slot: &Arc<tokio::sync::Mutex<Slot>>) -> bool {
        self.lock_slots().get(instance).map_or(false, |s| Arc::ptr_eq(s, slot))
    }

    fn slot(&self, instance: &InstanceRef) -> Result<Arc<tokio::sync::Mutex<Slot>>, CycleError> {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get(instance) {
            return Ok(Arc::clone(slot));
        }
        let units = (self.units)().map_err(|error| CycleError::Fatal {
            instance: instance.clone(),
            unit: "registry",
            error,
        })?;
        let slot = Arc::new(tokio::sync::Mutex::new(Slot {
            orchestrator: Orchestrator::new(Arc::clone(&self.client), units),
            context: Context::new(instance.clone()),
        }));
        slots.insert(instance.clone(), Arc::clone(&slot));
        Ok(slot)
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, FxHashMap<InstanceRef, Arc<tokio::sync::Mutex<Slot>>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
