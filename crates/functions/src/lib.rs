//! Regop control functions.
//!
//! Each unit owns one concern of the managed workload. [`default_registry`] fixes
//! the order they run in: `StatusCF` consumes what `ReplicasCF` publishes.

#![forbid(unsafe_code)]

mod infinispan;
mod replicas;
mod status;

pub use infinispan::{InfinispanCF, ENV_INFINISPAN_CLUSTER_NAME, PERSISTENCE_INFINISPAN};
pub use replicas::ReplicasCF;
pub use status::StatusCF;

use regop_core::{ControlRegistry, EngineError};

/// Units in execution order.
pub fn default_registry() -> Result<ControlRegistry, EngineError> {
    ControlRegistry::new()
        .with(ReplicasCF::new())?
        .with(InfinispanCF::new())?
        .with(StatusCF::new())
}

#[cfg(test)]
pub(crate) mod testing {
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use regop_core::{ApicurioRegistry, ApicurioRegistrySpec, Context, InstanceRef, Snapshot};

    pub fn registry(name: &str, edit: impl FnOnce(&mut ApicurioRegistrySpec)) -> ApicurioRegistry {
        let mut spec = ApicurioRegistrySpec::default();
        edit(&mut spec);
        let mut reg = ApicurioRegistry::new(name, spec);
        reg.metadata.namespace = Some("registry".into());
        reg
    }

    pub fn deployment(replicas: i32) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
            ..Default::default()
        }
    }

    pub fn context(snapshot: Snapshot) -> Context {
        let mut ctx = Context::new(InstanceRef::new("registry", "foo"));
        ctx.refresh(snapshot).unwrap();
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_runs_publisher_before_consumer() {
        let reg = default_registry().unwrap();
        assert_eq!(reg.names(), vec!["ReplicasCF", "InfinispanCF", "StatusCF"]);
    }
}
