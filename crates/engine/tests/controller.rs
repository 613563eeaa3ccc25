#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::EnvVar;
use regop_core::{
    deployment_replicas, ApicurioRegistry, ApicurioRegistrySpec, ClusterClient, InstanceRef, Resource,
};
use regop_engine::{CancellationToken, Controller, MemoryCluster};
use regop_functions::default_registry;

fn registry(name: &str, replicas: i32) -> ApicurioRegistry {
    let mut spec = ApicurioRegistrySpec::default();
    spec.deployment.replicas = replicas;
    let mut reg = ApicurioRegistry::new(name, spec);
    reg.metadata.namespace = Some("registry".into());
    reg
}

fn deployment(replicas: i32) -> Deployment {
    Deployment {
        spec: Some(DeploymentSpec { replicas: Some(replicas), ..Default::default() }),
        ..Default::default()
    }
}

/// Wraps the in-memory cluster and records how many cycles read the same instance at once.
struct SlowCluster {
    inner: MemoryCluster,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowCluster {
    fn new() -> Self {
        Self { inner: MemoryCluster::new(), in_flight: AtomicUsize::new(0), max_in_flight: AtomicUsize::new(0) }
    }
}

#[async_trait::async_trait]
impl ClusterClient for SlowCluster {
    async fn read_registry(&self, instance: &InstanceRef) -> Result<Option<ApicurioRegistry>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.read_registry(instance).await
    }

    async fn read_deployment(&self, instance: &InstanceRef) -> Result<Option<Deployment>> {
        self.inner.read_deployment(instance).await
    }

    async fn read_env(&self, instance: &InstanceRef) -> Result<Vec<EnvVar>> {
        self.inner.read_env(instance).await
    }

    async fn apply_resource(&self, instance: &InstanceRef, resource: &Resource) -> Result<Resource> {
        self.inner.apply_resource(instance, resource).await
    }

    async fn apply_env(&self, instance: &InstanceRef, var: &EnvVar) -> Result<EnvVar> {
        self.inner.apply_env(instance, var).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_instance_cycles_never_overlap() {
    let cluster = Arc::new(SlowCluster::new());
    let instance = cluster.inner.put_registry(registry("foo", 2));
    cluster.inner.put_deployment(&instance, deployment(1));

    let controller = Arc::new(Controller::new(cluster.clone(), default_registry).unwrap());
    let cancel = CancellationToken::new();
    let runs = (0..4).map(|_| {
        let controller = controller.clone();
        let instance = instance.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.trigger(&instance, &cancel).await })
    });
    for res in futures::future::join_all(runs).await {
        res.unwrap().unwrap();
    }

    assert_eq!(cluster.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(deployment_replicas(&cluster.inner.deployment(&instance).unwrap()), 2);
    assert_eq!(controller.instances(), vec![instance.clone()]);
    assert!(!controller.is_busy(&instance));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_instance_is_kept_until_its_cycle_ends() {
    let cluster = Arc::new(SlowCluster::new());
    let instance = cluster.inner.put_registry(registry("foo", 2));
    cluster.inner.put_deployment(&instance, deployment(1));

    let controller = Arc::new(Controller::new(cluster.clone(), default_registry).unwrap());
    let cancel = CancellationToken::new();
    let first = tokio::spawn({
        let (controller, instance, cancel) = (controller.clone(), instance.clone(), cancel.clone());
        async move { controller.trigger(&instance, &cancel).await }
    });
    while !controller.is_busy(&instance) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert!(!controller.forget(&instance));
    assert_eq!(controller.instances(), vec![instance.clone()]);
    let second = controller.trigger(&instance, &cancel).await;
    first.await.unwrap().unwrap();
    second.unwrap();
    assert_eq!(cluster.max_in_flight.load(Ordering::SeqCst), 1);

    assert!(!controller.is_busy(&instance));
    assert!(controller.forget(&instance));
    assert!(controller.instances().is_empty());
    assert!(!controller.forget(&instance));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instances_are_reconciled_independently() {
    let cluster = Arc::new(MemoryCluster::new());
    let a = cluster.put_registry(registry("a", 2));
    let b = cluster.put_registry(registry("b", 5));
    cluster.put_deployment(&a, deployment(1));
    cluster.put_deployment(&b, deployment(1));
    cluster.fail_writes_to("spec");

    let controller = Controller::new(cluster.clone(), default_registry).unwrap();
    let cancel = CancellationToken::new();
    let (ra, rb) = futures::join!(controller.trigger(&a, &cancel), controller.trigger(&b, &cancel));
    // Status writes fail for both; deployments are still written.
    assert!(ra.is_err() && rb.is_err());
    assert_eq!(deployment_replicas(&cluster.deployment(&a).unwrap()), 2);
    assert_eq!(deployment_replicas(&cluster.deployment(&b).unwrap()), 5);

    cluster.heal_writes();
    controller.trigger(&a, &cancel).await.unwrap();
    assert_eq!(cluster.registry(&a).unwrap().status.unwrap().replica_count, Some(2));
    assert!(cluster.registry(&b).unwrap().status.is_none());

    assert_eq!(controller.instances(), vec![a.clone(), b.clone()]);
    assert!(controller.forget(&b));
    assert_eq!(controller.instances(), vec![a]);
}
