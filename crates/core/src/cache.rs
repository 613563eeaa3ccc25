//! Cache entries and the keyed caches built from them.
//!
//! Values change only through [`CacheEntry::apply_patch`]: the transform sees the
//! current value by reference and must return a fresh one, so a value observed
//! earlier in the cycle is never mutated behind the observer's back. Patched
//! entries are dirty; dirty entries are the only ones the orchestrator writes.

use std::collections::hash_map::Entry;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::EngineError;
use crate::model::{ApicurioRegistry, Resource, ResourceKind};

/// Names the semantic kind of a cached value. The kind of a key is pinned on first insertion.
pub trait Tagged {
    fn tag(&self) -> &'static str;
}

impl Tagged for Resource {
    fn tag(&self) -> &'static str { self.kind().as_str() }
}

impl Tagged for EnvVar {
    fn tag(&self) -> &'static str { "EnvVar" }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    key: String,
    value: V,
    dirty: bool,
    /// Labels of the patches applied since the last flush, in call order.
    patches: SmallVec<[&'static str; 4]>,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self { key: key.into(), value, dirty: false, patches: SmallVec::new() }
    }

    pub fn key(&self) -> &str { &self.key }
    pub fn value(&self) -> &V { &self.value }
    pub fn is_dirty(&self) -> bool { self.dirty }
    pub fn patches(&self) -> &[&'static str] { &self.patches }

    /// Compose `transform` onto the current value. Later reads observe the result.
    pub fn apply_patch(&mut self, label: &'static str, transform: impl FnOnce(&V) -> V) {
        let next = transform(&self.value);
        self.value = next;
        self.dirty = true;
        self.patches.push(label);
    }

    /// Record a successful write: adopt the value the cluster returned and clear the dirty flag.
    pub fn settle(&mut self, written: V) {
        self.value = written;
        self.dirty = false;
        self.patches.clear();
    }
}

impl CacheEntry<Resource> {
    pub fn registry(&self) -> Result<&ApicurioRegistry, EngineError> {
        match &self.value {
            Resource::Registry(r) => Ok(r),
            other => Err(EngineError::mismatch(&self.key, ResourceKind::Registry.as_str(), other.tag())),
        }
    }

    pub fn deployment(&self) -> Result<&Deployment, EngineError> {
        match &self.value {
            Resource::Deployment(d) => Ok(d),
            other => Err(EngineError::mismatch(&self.key, ResourceKind::Deployment.as_str(), other.tag())),
        }
    }

    /// Patch a copy of the cached custom resource. Fails before queuing if the entry holds another kind.
    pub fn patch_registry(
        &mut self,
        label: &'static str,
        edit: impl FnOnce(&mut ApicurioRegistry),
    ) -> Result<(), EngineError> {
        self.registry()?;
        self.apply_patch(label, |value| match value {
            Resource::Registry(r) => {
                let mut next = r.clone();
                edit(&mut next);
                Resource::Registry(next)
            }
            other => other.clone(),
        });
        Ok(())
    }

    /// Patch a copy of the cached deployment. Fails before queuing if the entry holds another kind.
    pub fn patch_deployment(
        &mut self,
        label: &'static str,
        edit: impl FnOnce(&mut Deployment),
    ) -> Result<(), EngineError> {
        self.deployment()?;
        self.apply_patch(label, |value| match value {
            Resource::Deployment(d) => {
                let mut next = d.clone();
                edit(&mut next);
                Resource::Deployment(next)
            }
            other => other.clone(),
        });
        Ok(())
    }
}

impl CacheEntry<EnvVar> {
    /// Literal value of the variable; `valueFrom` sources read as empty.
    pub fn env_value(&self) -> &str { self.value.value.as_deref().unwrap_or("") }
}

/// Keyed store of cache entries. Enumeration order is unspecified.
#[derive(Debug, Clone)]
pub struct TypedCache<V> {
    entries: FxHashMap<String, CacheEntry<V>>,
    /// Kind pinned per key; survives `clear` for the lifetime of the owning context.
    tags: FxHashMap<String, &'static str>,
}

impl<V> Default for TypedCache<V> {
    fn default() -> Self { Self { entries: FxHashMap::default(), tags: FxHashMap::default() } }
}

impl<V: Tagged> TypedCache<V> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.entries.len() }
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
    pub fn contains(&self, key: &str) -> bool { self.entries.contains_key(key) }

    pub fn get(&self, key: &str) -> Option<&CacheEntry<V>> { self.entries.get(key) }
    pub fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry<V>> { self.entries.get_mut(key) }

    /// Insert or overwrite an entry. Used for seeding from a fresh read.
    pub fn set(&mut self, entry: CacheEntry<V>) -> Result<(), EngineError> {
        pin(&mut self.tags, &entry.key, entry.value.tag())?;
        self.entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    /// Existing entry for `key`, or a new clean one holding `init()`.
    pub fn get_or_create(
        &mut self,
        key: &str,
        init: impl FnOnce() -> V,
    ) -> Result<&mut CacheEntry<V>, EngineError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(slot) => Ok(slot.into_mut()),
            Entry::Vacant(slot) => {
                let value = init();
                pin(&mut self.tags, key, value.tag())?;
                Ok(slot.insert(CacheEntry::new(key, value)))
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> { self.entries.remove(key) }

    /// Drop every entry; pinned kinds are kept.
    pub fn clear(&mut self) { self.entries.clear(); }

    pub fn dirty(&self) -> impl Iterator<Item = &CacheEntry<V>> {
        self.entries.values().filter(|e| e.dirty)
    }

    /// Keys of dirty entries, sorted so flush order is stable across runs.
    pub fn dirty_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.dirty().map(|e| e.key.clone()).collect();
        keys.sort_unstable();
        keys
    }
}

fn pin(tags: &mut FxHashMap<String, &'static str>, key: &str, tag: &'static str) -> Result<(), EngineError> {
    match tags.get(key).copied() {
        Some(pinned) if pinned != tag => Err(EngineError::mismatch(key, pinned, tag)),
        Some(_) => Ok(()),
        None => {
            tags.insert(key.to_string(), tag);
            Ok(())
        }
    }
}
