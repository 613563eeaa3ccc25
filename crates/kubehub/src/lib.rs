//! Regop kubehub – live cluster reads and writes for the reconciliation engine

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    Client, ResourceExt,
};
use metrics::{counter, histogram};
use regop_core::{ApicurioRegistry, ClusterClient, InstanceRef, Resource, Snapshot};
use serde_json::json;
use tracing::{debug, info};

/// How the live cluster is addressed.
#[derive(Debug, Clone)]
pub struct KubeSettings {
    /// Field manager recorded on every write.
    pub field_manager: String,
    /// Name of the workload container whose env is managed; falls back to the first container.
    pub container: String,
    /// Label whose value equals the instance name on the managed deployment.
    pub app_label: String,
}

impl Default for KubeSettings {
    fn default() -> Self {
        Self { field_manager: "regop".into(), container: "registry".into(), app_label: "app".into() }
    }
}

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("creating kube client from current context")
}

/// [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    settings: KubeSettings,
}

impl KubeCluster {
    pub fn new(client: Client, settings: KubeSettings) -> Self { Self { client, settings } }

    pub async fn try_default(settings: KubeSettings) -> Result<Self> {
        Ok(Self::new(get_kube_client().await?, settings))
    }

    /// Every ApicurioRegistry in `namespace`, or cluster-wide when `None`.
    pub async fn list_instances(&self, namespace: Option<&str>) -> Result<Vec<InstanceRef>> {
        let api: Api<ApicurioRegistry> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let list = api.list(&ListParams::default()).await.context("listing ApicurioRegistry")?;
        let mut out: Vec<InstanceRef> = list.items.iter().map(InstanceRef::of).collect();
        out.sort();
        Ok(out)
    }

    fn registries(&self, instance: &InstanceRef) -> Api<ApicurioRegistry> {
        Api::namespaced(self.client.clone(), &instance.namespace)
    }

    fn deployments(&self, instance: &InstanceRef) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &instance.namespace)
    }

    fn post_params(&self) -> PostParams {
        let mut pp = PostParams::default();
        pp.field_manager = Some(self.settings.field_manager.clone());
        pp
    }

    fn patch_params(&self) -> PatchParams {
        let mut pp = PatchParams::default();
        pp.field_manager = Some(self.settings.field_manager.clone());
        pp
    }

    /// The deployment labelled for `instance`; the first by name if several match.
    async fn find_deployment(&self, instance: &InstanceRef) -> Result<Option<Deployment>> {
        let lp = ListParams::default().labels(&app_selector(&self.settings.app_label, &instance.name));
        let list = self
            .deployments(instance)
            .list(&lp)
            .await
            .with_context(|| format!("listing deployments for {instance}"))?;
        let mut items = list.items;
        items.sort_by_key(|d| d.name_any());
        Ok(items.into_iter().next().map(strip_managed_fields))
    }
}

fn app_selector(label: &str, name: &str) -> String { format!("{label}={name}") }

fn strip_managed_fields(mut d: Deployment) -> Deployment {
    d.metadata.managed_fields = None;
    d
}

fn workload_container<'a>(d: &'a Deployment, preferred: &str) -> Option<&'a Container> {
    let containers = &d.spec.as_ref()?.template.spec.as_ref()?.containers;
    containers.iter().find(|c| c.name == preferred).or_else(|| containers.first())
}

fn workload_env(d: Option<&Deployment>, preferred: &str) -> Vec<EnvVar> {
    d.and_then(|d| workload_container(d, preferred)).and_then(|c| c.env.clone()).unwrap_or_default()
}

/// Strategic-merge body setting one env var on one container; other vars are merged by name.
/// A literal value nulls `valueFrom`, which the merge would otherwise keep from the live var.
fn env_patch(container: &str, var: &EnvVar) -> serde_json::Value {
    let mut entry = json!(var);
    if var.value_from.is_none() {
        entry["valueFrom"] = serde_json::Value::Null;
    }
    json!({
        "spec": { "template": { "spec": { "containers": [ { "name": container, "env": [ entry ] } ] } } }
    })
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn read_registry(&self, instance: &InstanceRef) -> Result<Option<ApicurioRegistry>> {
        counter!("kube_read_total", 1u64);
        self.registries(instance)
            .get_opt(&instance.name)
            .await
            .with_context(|| format!("reading ApicurioRegistry {instance}"))
    }

    async fn read_deployment(&self, instance: &InstanceRef) -> Result<Option<Deployment>> {
        counter!("kube_read_total", 1u64);
        self.find_deployment(instance).await
    }

    async fn read_env(&self, instance: &InstanceRef) -> Result<Vec<EnvVar>> {
        counter!("kube_read_total", 1u64);
        let deployment = self.find_deployment(instance).await?;
        Ok(workload_env(deployment.as_ref(), &self.settings.container))
    }

    /// Deployment and env come from the same listed object.
    async fn read_snapshot(&self, instance: &InstanceRef) -> Result<Snapshot> {
        let (registry, deployment) =
            futures::try_join!(self.read_registry(instance), self.read_deployment(instance))?;
        let env = workload_env(deployment.as_ref(), &self.settings.container);
        debug!(instance = %instance, found = deployment.is_some(), env = env.len(), "snapshot read");
        Ok(Snapshot { registry, deployment, env })
    }

    async fn apply_resource(&self, instance: &InstanceRef, resource: &Resource) -> Result<Resource> {
        let t0 = Instant::now();
        let written = match resource {
            Resource::Registry(desired) => {
                let body = json!({ "status": desired.status });
                let obj = self
                    .registries(instance)
                    .patch_status(&instance.name, &self.patch_params(), &Patch::Merge(&body))
                    .await
                    .with_context(|| format!("patching status of {instance}"))?;
                Resource::Registry(obj)
            }
            Resource::Deployment(desired) => {
                let name = desired
                    .metadata
                    .name
                    .clone()
                    .ok_or_else(|| anyhow!("deployment for {instance} has no name"))?;
                let api = self.deployments(instance);
                // Without a resourceVersion the deployment was never observed: create it.
                let obj = if desired.metadata.resource_version.is_some() {
                    api.replace(&name, &self.post_params(), desired)
                        .await
                        .with_context(|| format!("replacing deployment {name}"))?
                } else {
                    info!(instance = %instance, deployment = %name, "creating deployment");
                    api.create(&self.post_params(), desired)
                        .await
                        .with_context(|| format!("creating deployment {name}"))?
                };
                Resource::Deployment(strip_managed_fields(obj))
            }
        };
        histogram!("kube_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(instance = %instance, kind = %resource.kind(), "resource written");
        Ok(written)
    }

    async fn apply_env(&self, instance: &InstanceRef, var: &EnvVar) -> Result<EnvVar> {
        let t0 = Instant::now();
        let deployment = self
            .find_deployment(instance)
            .await?
            .ok_or_else(|| anyhow!("deployment for {instance} not found"))?;
        let container = workload_container(&deployment, &self.settings.container)
            .map(|c| c.name.clone())
            .ok_or_else(|| anyhow!("deployment for {instance} has no containers"))?;
        let patched = self
            .deployments(instance)
            .patch(&deployment.name_any(), &self.patch_params(), &Patch::Strategic(env_patch(&container, var)))
            .await
            .with_context(|| format!("setting env {} on {instance}", var.name))?;
        histogram!("kube_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let stored = workload_container(&patched, &container)
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|e| e.name == var.name).cloned())
            .unwrap_or_else(|| var.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
    use kube::api::ObjectMeta;

    fn deployment(containers: &[&str]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("foo-deployment".into()),
                managed_fields: Some(vec![Default::default()]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: containers
                            .iter()
                            .map(|n| Container { name: n.to_string(), ..Default::default() })
                            .collect(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn workload_container_prefers_configured_name() {
        let d = deployment(&["sidecar", "registry"]);
        assert_eq!(workload_container(&d, "registry").unwrap().name, "registry");
        assert_eq!(workload_container(&d, "missing").unwrap().name, "sidecar");
        assert!(workload_container(&deployment(&[]), "registry").is_none());
    }

    #[test]
    fn env_patch_targets_one_container_by_name() {
        let var = EnvVar { name: "INFINISPAN_CLUSTER_NAME".into(), value: Some("foo".into()), ..Default::default() };
        let body = env_patch("registry", &var);
        let c = &body["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(c["name"], "registry");
        assert_eq!(c["env"][0]["name"], "INFINISPAN_CLUSTER_NAME");
        assert_eq!(c["env"][0]["value"], "foo");
        assert!(c["env"][0].as_object().unwrap().contains_key("valueFrom"));
        assert!(c["env"][0]["valueFrom"].is_null());
    }

    #[test]
    fn env_patch_keeps_value_from_when_set() {
        let var = EnvVar {
            name: "INFINISPAN_CLUSTER_NAME".into(),
            value_from: Some(Default::default()),
            ..Default::default()
        };
        let body = env_patch("registry", &var);
        assert!(body["spec"]["template"]["spec"]["containers"][0]["env"][0]["valueFrom"].is_object());
    }

    #[test]
    fn workload_env_reads_preferred_container() {
        let mut d = deployment(&["sidecar", "registry"]);
        let containers = &mut d.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers;
        containers[1].env = Some(vec![EnvVar { name: "A".into(), value: Some("1".into()), ..Default::default() }]);
        assert_eq!(workload_env(Some(&d), "registry").len(), 1);
        assert!(workload_env(Some(&d), "sidecar").is_empty());
        assert!(workload_env(None, "registry").is_empty());
    }

    #[test]
    fn managed_fields_are_stripped() {
        let d = strip_managed_fields(deployment(&["registry"]));
        assert!(d.metadata.managed_fields.is_none());
        assert_eq!(d.metadata.name.as_deref(), Some("foo-deployment"));
    }

    #[test]
    fn selector_uses_app_label() {
        assert_eq!(app_selector("app", "foo"), "app=foo");
    }
}
