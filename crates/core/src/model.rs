//! Managed custom resource and the tagged values stored in the resource cache.

use std::fmt;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

/// Desired state of one registry instance.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "apicur.io", version = "v1alpha1", kind = "ApicurioRegistry", namespaced)]
#[kube(status = "ApicurioRegistryStatus", schema = "disabled", derive = "PartialEq", derive = "Default")]
#[serde(rename_all = "camelCase")]
pub struct ApicurioRegistrySpec {
    #[serde(default)]
    pub configuration: ConfigurationSpec,
    #[serde(default)]
    pub deployment: DeploymentSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSpec {
    /// Storage backend: `mem`, `sql`, `kafka` or `infinispan`.
    #[serde(default)]
    pub persistence: String,
    #[serde(default)]
    pub infinispan: InfinispanSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfinispanSpec {
    /// Empty means "use the instance name".
    #[serde(default)]
    pub cluster_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default)]
    pub replicas: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApicurioRegistryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i32>,
}

/// Identity of one managed instance (one custom resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceRef {
    pub namespace: String,
    pub name: String,
}

impl InstanceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Identity of an already-fetched custom resource; a missing namespace maps to `default`.
    pub fn of(registry: &ApicurioRegistry) -> Self {
        Self {
            namespace: registry.namespace().unwrap_or_else(|| "default".to_string()),
            name: registry.name_any(),
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Registry,
    Deployment,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Registry => "ApicurioRegistry",
            ResourceKind::Deployment => "Deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value held by the resource cache, tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Registry(ApicurioRegistry),
    Deployment(Deployment),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Registry(_) => ResourceKind::Registry,
            Resource::Deployment(_) => ResourceKind::Deployment,
        }
    }
}

/// Replica count of a live deployment; unset means the cluster default of 1.
pub fn deployment_replicas(deployment: &Deployment) -> i32 {
    deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parses_camel_case_with_defaults() {
        let raw = serde_json::json!({
            "apiVersion": "apicur.io/v1alpha1",
            "kind": "ApicurioRegistry",
            "metadata": { "name": "foo", "namespace": "reg" },
            "spec": { "configuration": { "persistence": "infinispan", "infinispan": { "clusterName": "ispn" } } }
        });
        let reg: ApicurioRegistry = serde_json::from_value(raw).unwrap();
        assert_eq!(reg.spec.configuration.persistence, "infinispan");
        assert_eq!(reg.spec.configuration.infinispan.cluster_name, "ispn");
        assert_eq!(reg.spec.deployment.replicas, 0);
        assert_eq!(InstanceRef::of(&reg).to_string(), "reg/foo");
    }

    #[test]
    fn unset_deployment_replicas_reads_as_one() {
        assert_eq!(deployment_replicas(&Deployment::default()), 1);
    }
}
