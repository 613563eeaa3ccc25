use k8s_openapi::api::core::v1::EnvVar;
use regop_core::{Context, ControlFunction, EngineError, RC_KEY_SPEC};
use tracing::debug;

pub const ENV_INFINISPAN_CLUSTER_NAME: &str = "INFINISPAN_CLUSTER_NAME";
pub const PERSISTENCE_INFINISPAN: &str = "infinispan";

/// Injects the Infinispan cluster name into the workload environment when the
/// registry is configured for Infinispan persistence.
///
/// Variables are never removed when persistence changes away from Infinispan.
#[derive(Debug, Default)]
pub struct InfinispanCF {
    persistence: String,
    cluster_name: String,
    valid: bool,
    env_cluster_name: Option<String>,
}

impl InfinispanCF {
    pub fn new() -> Self { Self::default() }
}

impl ControlFunction for InfinispanCF {
    fn describe(&self) -> &'static str { "InfinispanCF" }

    fn sense(&mut self, ctx: &mut Context) -> Result<(), EngineError> {
        *self = Self::default();

        if let Some(entry) = ctx.resource_cache().get(RC_KEY_SPEC) {
            let registry = entry.registry()?;
            self.persistence = registry.spec.configuration.persistence.clone();
            self.cluster_name = registry.spec.configuration.infinispan.cluster_name.clone();
            if self.cluster_name.is_empty() {
                self.cluster_name = registry.metadata.name.clone().unwrap_or_else(|| ctx.instance().name.clone());
            }
        }
        self.valid = self.persistence == PERSISTENCE_INFINISPAN && !self.cluster_name.is_empty();

        self.env_cluster_name = ctx
            .env_cache()
            .get(ENV_INFINISPAN_CLUSTER_NAME)
            .map(|e| e.env_value().to_string());
        Ok(())
    }

    fn compare(&self) -> bool {
        self.valid && self.env_cluster_name.as_deref() != Some(self.cluster_name.as_str())
    }

    fn respond(&mut self, ctx: &mut Context) -> Result<(), EngineError> {
        let value = self.cluster_name.clone();
        debug!(cluster = %value, previous = ?self.env_cluster_name, "setting infinispan cluster name");
        let entry = ctx.env_cache_mut().get_or_create(ENV_INFINISPAN_CLUSTER_NAME, || EnvVar {
            name: ENV_INFINISPAN_CLUSTER_NAME.to_string(),
            ..Default::default()
        })?;
        entry.apply_patch("infinispan-cluster-name", move |var| EnvVar {
            value: Some(value),
            value_from: None,
            ..var.clone()
        });
        Ok(())
    }
}
