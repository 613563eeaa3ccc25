//! In-memory cluster used by tests and by offline simulation.
//!
//! Mirrors the write semantics the engine relies on: deployments are replaced
//! at their observed `resourceVersion` (stale writes conflict), registry writes
//! only touch status, env writes patch the first container's env by name.

use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;
use regop_core::{ApicurioRegistry, ClusterClient, InstanceRef, Resource};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteRecord {
    pub instance: InstanceRef,
    pub target: String,
}

#[derive(Debug, Default, Clone)]
struct Objects {
    registry: Option<ApicurioRegistry>,
    deployment: Option<Deployment>,
}

#[derive(Debug, Default)]
struct State {
    objects: FxHashMap<InstanceRef, Objects>,
    fail_reads: bool,
    fail_writes: FxHashSet<String>,
    writes: Vec<WriteRecord>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Store (or replace) a custom resource, keyed by its own namespace/name.
    pub fn put_registry(&self, registry: ApicurioRegistry) -> InstanceRef {
        let instance = InstanceRef::of(&registry);
        self.lock().objects.entry(instance.clone()).or_default().registry = Some(registry);
        instance
    }

    /// Store (or replace) the deployment of `instance`, assigning a fresh resource version.
    pub fn put_deployment(&self, instance: &InstanceRef, mut deployment: Deployment) {
        let mut st = self.lock();
        deployment.metadata.resource_version = Some(st.next_version());
        st.objects.entry(instance.clone()).or_default().deployment = Some(deployment);
    }

    pub fn remove_deployment(&self, instance: &InstanceRef) {
        if let Some(objs) = self.lock().objects.get_mut(instance) {
            objs.deployment = None;
        }
    }

    pub fn registry(&self, instance: &InstanceRef) -> Option<ApicurioRegistry> {
        self.lock().objects.get(instance).and_then(|o| o.registry.clone())
    }

    pub fn deployment(&self, instance: &InstanceRef) -> Option<Deployment> {
        self.lock().objects.get(instance).and_then(|o| o.deployment.clone())
    }

    pub fn env(&self, instance: &InstanceRef) -> Vec<EnvVar> {
        self.lock().objects.get(instance).and_then(|o| o.deployment.as_ref()).map(container_env).unwrap_or_default()
    }

    /// Make every read fail until reset.
    pub fn set_fail_reads(&self, on: bool) { self.lock().fail_reads = on; }

    /// Make writes to `target` (`spec`, `deployment` or `env:NAME`) fail until healed.
    pub fn fail_writes_to(&self, target: &str) { self.lock().fail_writes.insert(target.to_string()); }

    pub fn heal_writes(&self) { self.lock().fail_writes.clear(); }

    /// Successful writes in the order they happened.
    pub fn writes(&self) -> Vec<WriteRecord> { self.lock().writes.clone() }

    pub fn clear_writes(&self) { self.lock().writes.clear(); }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_read(st: &State) -> Result<()> {
        if st.fail_reads {
            bail!("cluster unreachable");
        }
        Ok(())
    }

    fn check_write(st: &State, target: &str) -> Result<()> {
        if st.fail_writes.contains(target) {
            bail!("injected write failure on {target}");
        }
        Ok(())
    }
}

fn container_env(deployment: &Deployment) -> Vec<EnvVar> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.first())
        .and_then(|c| c.env.clone())
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl ClusterClient for MemoryCluster {
    async fn read_registry(&self, instance: &InstanceRef) -> Result<Option<ApicurioRegistry>> {
        let st = self.lock();
        Self::check_read(&st)?;
        Ok(st.objects.get(instance).and_then(|o| o.registry.clone()))
    }

    async fn read_deployment(&self, instance: &InstanceRef) -> Result<Option<Deployment>> {
        let st = self.lock();
        Self::check_read(&st)?;
        Ok(st.objects.get(instance).and_then(|o| o.deployment.clone()))
    }

    async fn read_env(&self, instance: &InstanceRef) -> Result<Vec<EnvVar>> {
        let st = self.lock();
        Self::check_read(&st)?;
        Ok(st.objects.get(instance).and_then(|o| o.deployment.as_ref()).map(container_env).unwrap_or_default())
    }

    async fn apply_resource(&self, instance: &InstanceRef, resource: &Resource) -> Result<Resource> {
        let mut st = self.lock();
        let target = match resource {
            Resource::Registry(_) => regop_core::RC_KEY_SPEC,
            Resource::Deployment(_) => regop_core::RC_KEY_DEPLOYMENT,
        };
        Self::check_write(&st, target)?;
        let written = match resource {
            Resource::Registry(desired) => {
                let stored = st
                    .objects
                    .get_mut(instance)
                    .and_then(|o| o.registry.as_mut())
                    .ok_or_else(|| anyhow!("registry {instance} not found"))?;
                stored.status = desired.status.clone();
                Resource::Registry(stored.clone())
            }
            Resource::Deployment(desired) => {
                let live_rv = st
                    .objects
                    .get(instance)
                    .and_then(|o| o.deployment.as_ref())
                    .map(|d| d.metadata.resource_version.clone());
                match live_rv {
                    Some(live) if live != desired.metadata.resource_version => {
                        bail!(
                            "conflict writing deployment for {instance}: resourceVersion {:?} is stale (live {:?})",
                            desired.metadata.resource_version,
                            live
                        );
                    }
                    None if desired.metadata.resource_version.is_some() => {
                        bail!("deployment for {instance} was deleted");
                    }
                    _ => {}
                }
                let mut next = desired.clone();
                next.metadata.resource_version = Some(st.next_version());
                st.objects.entry(instance.clone()).or_default().deployment = Some(next.clone());
                Resource::Deployment(next)
            }
        };
        st.writes.push(WriteRecord { instance: instance.clone(), target: target.to_string() });
        Ok(written)
    }

    async fn apply_env(&self, instance: &InstanceRef, var: &EnvVar) -> Result<EnvVar> {
        let mut st = self.lock();
        let target = format!("env:{}", var.name);
        Self::check_write(&st, &target)?;
        let version = st.next_version();
        let deployment = st
            .objects
            .get_mut(instance)
            .and_then(|o| o.deployment.as_mut())
            .ok_or_else(|| anyhow!("deployment for {instance} not found"))?;
        let container = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .and_then(|p| p.containers.first_mut())
            .ok_or_else(|| anyhow!("deployment for {instance} has no containers"))?;
        let env = container.env.get_or_insert_with(Vec::new);
        match env.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => *existing = var.clone(),
            None => env.push(var.clone()),
        }
        deployment.metadata.resource_version = Some(version);
        st.writes.push(WriteRecord { instance: instance.clone(), target });
        Ok(var.clone())
    }
}
