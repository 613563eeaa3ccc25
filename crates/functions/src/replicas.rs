use regop_core::{
    deployment_replicas, Context, ControlFunction, EngineError, CFG_STA_REPLICA_COUNT, RC_KEY_DEPLOYMENT,
    RC_KEY_SPEC,
};
use tracing::debug;

/// Keeps the deployment's replica count aligned with `spec.deployment.replicas`.
///
/// Publishes the observed count under [`CFG_STA_REPLICA_COUNT`] every cycle and
/// clears it while there is no deployment.
#[derive(Debug, Default)]
pub struct ReplicasCF {
    deployment_exists: bool,
    existing_replicas: i32,
    target_replicas: i32,
}

impl ReplicasCF {
    pub fn new() -> Self { Self::default() }
}

impl ControlFunction for ReplicasCF {
    fn describe(&self) -> &'static str { "ReplicasCF" }

    fn sense(&mut self, ctx: &mut Context) -> Result<(), EngineError> {
        *self = Self::default();

        if let Some(entry) = ctx.resource_cache().get(RC_KEY_DEPLOYMENT) {
            self.deployment_exists = true;
            self.existing_replicas = deployment_replicas(entry.deployment()?);
        }
        if let Some(entry) = ctx.resource_cache().get(RC_KEY_SPEC) {
            self.target_replicas = entry.registry()?.spec.deployment.replicas;
        }
        if self.target_replicas < 1 {
            self.target_replicas = 1;
        }

        let cfg = ctx.configuration_mut();
        if self.deployment_exists {
            cfg.set_config_i32(CFG_STA_REPLICA_COUNT, self.existing_replicas)?;
        } else {
            cfg.clear(CFG_STA_REPLICA_COUNT);
        }
        Ok(())
    }

    fn compare(&self) -> bool {
        self.deployment_exists && self.existing_replicas != self.target_replicas
    }

    fn respond(&mut self, ctx: &mut Context) -> Result<(), EngineError> {
        let target = self.target_replicas;
        if let Some(entry) = ctx.resource_cache_mut().get_mut(RC_KEY_DEPLOYMENT) {
            debug!(from = self.existing_replicas, to = target, "scaling deployment");
            entry.patch_deployment("replicas", |d| {
                d.spec.get_or_insert_with(Default::default).replicas = Some(target);
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, deployment, registry};
    use regop_core::Snapshot;

    fn run(cf: &mut ReplicasCF, ctx: &mut Context) -> bool {
        cf.sense(ctx).unwrap();
        let drift = cf.compare();
        if drift {
            cf.respond(ctx).unwrap();
        }
        drift
    }

    fn cached_replicas(ctx: &Context) -> i32 {
        deployment_replicas(ctx.resource_cache().get(RC_KEY_DEPLOYMENT).unwrap().deployment().unwrap())
    }

    #[test]
    fn scales_deployment_to_desired_replicas() {
        let mut ctx = context(Snapshot {
            registry: Some(registry("foo", |s| s.deployment.replicas = 3)),
            deployment: Some(deployment(1)),
            env: vec![],
        });
        let mut cf = ReplicasCF::new();
        assert!(run(&mut cf, &mut ctx));
        assert_eq!(cached_replicas(&ctx), 3);
        assert!(ctx.resource_cache().get(RC_KEY_DEPLOYMENT).unwrap().is_dirty());

        let mut next = context(Snapshot {
            registry: Some(registry("foo", |s| s.deployment.replicas = 3)),
            deployment: Some(deployment(3)),
            env: vec![],
        });
        assert!(!run(&mut cf, &mut next));
        assert!(!next.has_dirty());
    }

    #[test]
    fn non_positive_desired_replicas_coerce_to_one() {
        for desired in [0, -4] {
            let mut ctx = context(Snapshot {
                registry: Some(registry("foo", |s| s.deployment.replicas = desired)),
                deployment: Some(deployment(2)),
                env: vec![],
            });
            let mut cf = ReplicasCF::new();
            assert!(run(&mut cf, &mut ctx));
            assert_eq!(cf.target_replicas, 1);
            assert_eq!(cached_replicas(&ctx), 1);
        }
    }

    #[test]
    fn missing_deployment_means_no_action() {
        let mut ctx = context(Snapshot {
            registry: Some(registry("foo", |s| s.deployment.replicas = 5)),
            deployment: None,
            env: vec![],
        });
        let mut cf = ReplicasCF::new();
        assert!(!run(&mut cf, &mut ctx));
        assert!(!ctx.has_dirty());
    }

    #[test]
    fn publishes_observed_count_and_clears_it_when_deployment_vanishes() {
        let mut ctx = context(Snapshot {
            registry: Some(registry("foo", |s| s.deployment.replicas = 2)),
            deployment: Some(deployment(2)),
            env: vec![],
        });
        let mut cf = ReplicasCF::new();
        cf.sense(&mut ctx).unwrap();
        assert_eq!(ctx.configuration().get_config_i32(CFG_STA_REPLICA_COUNT).unwrap(), Some(2));

        ctx.refresh(Snapshot {
            registry: Some(registry("foo", |s| s.deployment.replicas = 2)),
            deployment: None,
            env: vec![],
        })
        .unwrap();
        cf.sense(&mut ctx).unwrap();
        assert_eq!(ctx.configuration().get_config_i32(CFG_STA_REPLICA_COUNT).unwrap(), None);
    }
}
