use regop_core::{Context, ControlFunction, EngineError, CFG_STA_REPLICA_COUNT, RC_KEY_SPEC};

/// Mirrors the replica count published by `ReplicasCF` into the custom resource status.
#[derive(Debug, Default)]
pub struct StatusCF {
    spec_exists: bool,
    observed: Option<i32>,
    reported: Option<i32>,
}

impl StatusCF {
    pub fn new() -> Self { Self::default() }
}

impl ControlFunction for StatusCF {
    fn describe(&self) -> &'static str { "StatusCF" }

    fn sense(&mut self, ctx: &mut Context) -> Result<(), EngineError> {
        *self = Self::default();
        self.observed = ctx.configuration().get_config_i32(CFG_STA_REPLICA_COUNT)?;
        if let Some(entry) = ctx.resource_cache().get(RC_KEY_SPEC) {
            self.spec_exists = true;
            self.reported = entry.registry()?.status.as_ref().and_then(|s| s.replica_count);
        }
        Ok(())
    }

    fn compare(&self) -> bool {
        self.spec_exists && self.observed.is_some() && self.observed != self.reported
    }

    fn respond(&mut self, ctx: &mut Context) -> Result<(), EngineError> {
        let observed = self.observed;
        if let Some(entry) = ctx.resource_cache_mut().get_mut(RC_KEY_SPEC) {
            entry.patch_registry("status-replicas", |r| {
                r.status.get_or_insert_with(Default::default).replica_count = observed;
            })?;
        }
        Ok(())
    }
}
