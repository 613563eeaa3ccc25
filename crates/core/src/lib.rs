//! Regop core: the state a reconciliation cycle operates on.
//!
//! A [`Context`] holds two typed caches (resources and environment variables)
//! plus a [`ConfigStore`] for values one control function publishes for another.
//! Control functions only ever see the context; cluster I/O goes through
//! [`ClusterClient`] and is driven by the orchestrator.

#![forbid(unsafe_code)]

pub mod cache;
pub mod client;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod model;

pub use cache::{CacheEntry, Tagged, TypedCache};
pub use client::{ClusterClient, Snapshot};
pub use config::{ConfigStore, ConfigValue};
pub use context::Context;
pub use control::{ControlFunction, ControlRegistry};
pub use error::EngineError;
pub use model::{
    deployment_replicas, ApicurioRegistry, ApicurioRegistrySpec, ApicurioRegistryStatus, InstanceRef, Resource,
    ResourceKind,
};

/// Resource cache key of the managed custom resource.
pub const RC_KEY_SPEC: &str = "spec";
/// Resource cache key of the live deployment.
pub const RC_KEY_DEPLOYMENT: &str = "deployment";

/// Replica count observed on the live deployment during the current cycle.
pub const CFG_STA_REPLICA_COUNT: &str = "status.replicaCount";

pub mod prelude {
    pub use super::{
        CacheEntry, ClusterClient, ConfigStore, Context, ControlFunction, ControlRegistry, EngineError,
        InstanceRef, Resource, ResourceKind, Snapshot, TypedCache, CFG_STA_REPLICA_COUNT, RC_KEY_DEPLOYMENT,
        RC_KEY_SPEC,
    };
}
