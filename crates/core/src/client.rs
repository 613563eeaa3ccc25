//! Boundary to the live cluster. Implemented by the kube integration and by the
//! in-memory cluster used in tests and simulations.

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;

use crate::model::{ApicurioRegistry, InstanceRef, Resource};

/// Everything read from the cluster at the start of a cycle.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub registry: Option<ApicurioRegistry>,
    pub deployment: Option<Deployment>,
    pub env: Vec<EnvVar>,
}

#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// The managed custom resource; `None` when it does not exist.
    async fn read_registry(&self, instance: &InstanceRef) -> Result<Option<ApicurioRegistry>>;

    /// The workload deployment; `None` when it has not been created yet.
    async fn read_deployment(&self, instance: &InstanceRef) -> Result<Option<Deployment>>;

    /// Environment of the workload container. Empty when there is no workload.
    async fn read_env(&self, instance: &InstanceRef) -> Result<Vec<EnvVar>>;

    /// One read per resource kind for the start of a cycle. Implementations that
    /// derive several kinds from one object should override this and read it once.
    async fn read_snapshot(&self, instance: &InstanceRef) -> Result<Snapshot> {
        let (registry, deployment, env) = futures::try_join!(
            self.read_registry(instance),
            self.read_deployment(instance),
            self.read_env(instance),
        )?;
        Ok(Snapshot { registry, deployment, env })
    }

    /// Update-or-create one resource from its patched cached value; returns what the cluster stored.
    async fn apply_resource(&self, instance: &InstanceRef, resource: &Resource) -> Result<Resource>;

    /// Set one environment variable on the workload container; returns the stored variable.
    async fn apply_env(&self, instance: &InstanceRef, var: &EnvVar) -> Result<EnvVar>;
}
