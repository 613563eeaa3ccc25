use k8s_openapi::api::core::v1::EnvVar;

use crate::cache::{CacheEntry, TypedCache};
use crate::client::Snapshot;
use crate::config::ConfigStore;
use crate::error::EngineError;
use crate::model::{InstanceRef, Resource};
use crate::{RC_KEY_DEPLOYMENT, RC_KEY_SPEC};

/// Shared state for one managed instance.
///
/// Caches are rebuilt from a fresh [`Snapshot`] every cycle; the configuration
/// store outlives cycles.
#[derive(Debug, Clone)]
pub struct Context {
    instance: InstanceRef,
    resources: TypedCache<Resource>,
    env: TypedCache<EnvVar>,
    config: ConfigStore,
    cycle: u64,
}

impl Context {
    pub fn new(instance: InstanceRef) -> Self {
        Self {
            instance,
            resources: TypedCache::new(),
            env: TypedCache::new(),
            config: ConfigStore::new(),
            cycle: 0,
        }
    }

    pub fn instance(&self) -> &InstanceRef { &self.instance }
    /// Number of times the caches have been seeded.
    pub fn cycle(&self) -> u64 { self.cycle }

    pub fn resource_cache(&self) -> &TypedCache<Resource> { &self.resources }
    pub fn resource_cache_mut(&mut self) -> &mut TypedCache<Resource> { &mut self.resources }

    pub fn env_cache(&self) -> &TypedCache<EnvVar> { &self.env }
    pub fn env_cache_mut(&mut self) -> &mut TypedCache<EnvVar> { &mut self.env }

    pub fn configuration(&self) -> &ConfigStore { &self.config }
    pub fn configuration_mut(&mut self) -> &mut ConfigStore { &mut self.config }

    /// Replace both caches with a fresh read. Pending patches from an earlier cycle are dropped.
    pub fn refresh(&mut self, snapshot: Snapshot) -> Result<(), EngineError> {
        self.resources.clear();
        self.env.clear();
        if let Some(registry) = snapshot.registry {
            self.resources.set(CacheEntry::new(RC_KEY_SPEC, Resource::Registry(registry)))?;
        }
        if let Some(deployment) = snapshot.deployment {
            self.resources.set(CacheEntry::new(RC_KEY_DEPLOYMENT, Resource::Deployment(deployment)))?;
        }
        for var in snapshot.env {
            let key = var.name.clone();
            self.env.set(CacheEntry::new(key, var))?;
        }
        self.cycle = self.cycle.saturating_add(1);
        Ok(())
    }

    pub fn has_dirty(&self) -> bool {
        self.resources.dirty().next().is_some() || self.env.dirty().next().is_some()
    }
}
