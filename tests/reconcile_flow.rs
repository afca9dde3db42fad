//! End-to-end reconciliation behavior against an in-memory cluster.
//!
//! The in-memory gateway behaves like the API server where it matters:
//! replace bumps the resource version and echoes a Modified event back
//! into the open watch stream, so the finalizer write-back re-triggers
//! the loop exactly as it would against a real cluster.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use kube_operator_rust::gateway::{
    GatewayError, ResourceEvent, ResourceGateway, ResourceListing, WatchStream,
};
use kube_operator_rust::leader_election::LeaderGate;
use kube_operator_rust::operator::Operator;
use kube_operator_rust::reconciler::Reconciler;
use kube_operator_rust::registration::{ControllerDescriptor, ResourceConfig};
use kube_operator_rust::resource::WatchedResource;
use kube_operator_rust::watcher::ResourceWatcher;
use kube_operator_rust::OperatorConfig;

const FINALIZER: &str = "demos.example.com/finalizer";

#[derive(Clone, Debug)]
struct TestResource {
    uid: String,
    name: String,
    generation: Option<i64>,
    resource_version: String,
    finalizers: Vec<String>,
}

impl TestResource {
    fn new(uid: &str, generation: i64) -> Self {
        Self {
            uid: uid.to_string(),
            name: format!("demo-{uid}"),
            generation: Some(generation),
            resource_version: "1".to_string(),
            finalizers: vec![],
        }
    }
}

impl WatchedResource for TestResource {
    fn uid(&self) -> Option<&str> {
        Some(&self.uid)
    }

    fn generation(&self) -> Option<i64> {
        self.generation
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> Option<&str> {
        Some("default")
    }

    fn resource_version(&self) -> Option<&str> {
        Some(&self.resource_version)
    }

    fn finalizers(&self) -> &[String] {
        &self.finalizers
    }

    fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.finalizers = finalizers;
    }
}

type EventResult = Result<ResourceEvent<TestResource>, GatewayError>;

/// In-memory stand-in for the API server: stores objects, serves one
/// watch stream at a time, and echoes every replace as a Modified
/// event with a bumped resource version.
#[derive(Default)]
struct InMemoryCluster {
    objects: Mutex<HashMap<String, TestResource>>,
    deleting: Mutex<HashSet<String>>,
    watch_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<EventResult>>>,
}

impl InMemoryCluster {
    /// Stores an object without emitting an event.
    fn seed(&self, resource: TestResource) {
        self.objects
            .lock()
            .unwrap()
            .insert(resource.uid.clone(), resource);
    }

    /// Marks an object as pending deletion: once a replace drops its
    /// last finalizer, the object disappears instead of being stored.
    fn mark_deleting(&self, uid: &str) {
        self.deleting.lock().unwrap().insert(uid.to_string());
    }

    /// Pushes an event into the open watch stream.
    fn emit(&self, event: ResourceEvent<TestResource>) {
        let tx = self.watch_tx.lock().unwrap();
        tx.as_ref()
            .expect("no watch session open")
            .send(Ok(event))
            .expect("watch stream dropped");
    }

    fn stored(&self, uid: &str) -> Option<TestResource> {
        self.objects.lock().unwrap().get(uid).cloned()
    }
}

#[async_trait]
impl ResourceGateway<TestResource> for InMemoryCluster {
    async fn list(&self) -> Result<ResourceListing<TestResource>, GatewayError> {
        Ok(ResourceListing {
            items: self.objects.lock().unwrap().values().cloned().collect(),
            resource_version: Some("1".to_string()),
        })
    }

    async fn watch(
        &self,
        _resource_version: Option<String>,
    ) -> Result<WatchStream<TestResource>, GatewayError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        *self.watch_tx.lock().unwrap() = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn replace(&self, resource: &TestResource) -> Result<TestResource, GatewayError> {
        let (updated, completed_delete) = {
            let mut objects = self.objects.lock().unwrap();
            let current = objects
                .get(&resource.uid)
                .ok_or(GatewayError::NotFound)?
                .clone();
            if current.resource_version != resource.resource_version {
                return Err(GatewayError::Conflict);
            }

            let version: u64 = current.resource_version.parse().unwrap();
            let mut updated = resource.clone();
            updated.resource_version = (version + 1).to_string();

            // Dropping the last finalizer on a deleting object lets the
            // server complete the deletion.
            let completed_delete = updated.finalizers.is_empty()
                && self.deleting.lock().unwrap().contains(&updated.uid);
            if completed_delete {
                objects.remove(&updated.uid);
            } else {
                objects.insert(updated.uid.clone(), updated.clone());
            }
            (updated, completed_delete)
        };

        // The API server redelivers every write to open watches.
        if completed_delete {
            self.emit(ResourceEvent::Deleted(updated.clone()));
        } else {
            self.emit(ResourceEvent::Modified(updated.clone()));
        }
        Ok(updated)
    }
}

/// Records reconciler calls as `callback:uid@generation`.
#[derive(Default)]
struct CountingReconciler {
    calls: Mutex<Vec<String>>,
}

impl CountingReconciler {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, callback: &str, resource: &TestResource) {
        self.calls.lock().unwrap().push(format!(
            "{}:{}@{}",
            callback,
            resource.uid,
            resource.generation.unwrap_or(0)
        ));
    }
}

#[async_trait]
impl Reconciler<TestResource> for CountingReconciler {
    async fn add_or_modify(
        &self,
        resource: &TestResource,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.record("apply", resource);
        Ok(())
    }

    async fn delete(
        &self,
        resource: &TestResource,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.record("delete", resource);
        Ok(())
    }

    async fn finalize(
        &self,
        resource: &TestResource,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.record("finalize", resource);
        Ok(())
    }
}

fn demo_config() -> ResourceConfig {
    ResourceConfig::new("example.com", "v1", "Demo", "demos")
        .with_resubscribe_delay(Duration::from_millis(10))
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !probe() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// The full lifecycle: a fresh resource gets the finalizer before any
/// business logic, each generation is reconciled exactly once, and
/// deletion runs finalize/delete before releasing the finalizer.
#[tokio::test]
async fn resource_lifecycle_via_watch_stream() {
    let cluster = Arc::new(InMemoryCluster::default());
    let reconciler = Arc::new(CountingReconciler::default());
    let watcher = Arc::new(ResourceWatcher::new(
        demo_config(),
        cluster.clone() as Arc<dyn ResourceGateway<TestResource>>,
        reconciler.clone() as Arc<dyn Reconciler<TestResource>>,
        LeaderGate::always_leader(),
    ));

    let cancel = CancellationToken::new();
    let handle = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };

    // Wait for the watch session to open before emitting.
    wait_until(|| cluster.watch_tx.lock().unwrap().is_some()).await;

    // A fresh resource appears. The loop must write the finalizer back
    // without calling business logic; the echoed Modified event then
    // carries the finalizer and triggers exactly one reconciliation.
    cluster.seed(TestResource::new("u-1", 1));
    cluster.emit(ResourceEvent::Added(TestResource::new("u-1", 1)));

    wait_until(|| reconciler.calls().len() == 1).await;
    assert_eq!(reconciler.calls(), vec!["apply:u-1@1"]);
    let stored = cluster.stored("u-1").unwrap();
    assert!(stored.finalizers.contains(&FINALIZER.to_string()));

    // A duplicate delivery of the same generation is skipped.
    cluster.emit(ResourceEvent::Modified(stored.clone()));

    // A spec change bumps the generation and is reconciled again.
    let mut changed = stored.clone();
    changed.generation = Some(2);
    cluster.emit(ResourceEvent::Modified(changed.clone()));

    wait_until(|| reconciler.calls().len() == 2).await;
    assert_eq!(reconciler.calls(), vec!["apply:u-1@1", "apply:u-1@2"]);

    // Deletion: finalize and delete run, then the finalizer is
    // released so the API server can complete the delete.
    cluster.mark_deleting("u-1");
    cluster.emit(ResourceEvent::Deleted(changed.clone()));

    wait_until(|| reconciler.calls().len() == 4).await;
    assert_eq!(
        reconciler.calls(),
        vec![
            "apply:u-1@1",
            "apply:u-1@2",
            "finalize:u-1@2",
            "delete:u-1@2"
        ]
    );
    assert!(cluster.stored("u-1").is_none());

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

/// A Deleted event for a resource that never carried our finalizer
/// results in zero reconciler calls.
#[tokio::test]
async fn delete_without_finalizer_is_silent() {
    let cluster = Arc::new(InMemoryCluster::default());
    let reconciler = Arc::new(CountingReconciler::default());
    let watcher = Arc::new(ResourceWatcher::new(
        demo_config(),
        cluster.clone() as Arc<dyn ResourceGateway<TestResource>>,
        reconciler.clone() as Arc<dyn Reconciler<TestResource>>,
        LeaderGate::always_leader(),
    ));

    let cancel = CancellationToken::new();
    let handle = {
        let watcher = watcher.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { watcher.run(cancel).await })
    };

    wait_until(|| cluster.watch_tx.lock().unwrap().is_some()).await;
    cluster.emit(ResourceEvent::Deleted(TestResource::new("u-9", 1)));

    // Prove the silence by following with an event that does act.
    cluster.seed(TestResource::new("u-1", 1));
    cluster.emit(ResourceEvent::Added(TestResource::new("u-1", 1)));
    wait_until(|| !reconciler.calls().is_empty()).await;

    assert_eq!(reconciler.calls(), vec!["apply:u-1@1"]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

/// The supervisor path: registering a descriptor and running the
/// operator drives the same pipeline, and shutdown drains it.
#[tokio::test]
async fn operator_runs_registered_controller() {
    let cluster = Arc::new(InMemoryCluster::default());
    let reconciler = Arc::new(CountingReconciler::default());
    cluster.seed(TestResource {
        finalizers: vec![FINALIZER.to_string()],
        ..TestResource::new("u-1", 7)
    });

    let mut config = OperatorConfig::default();
    config.generic.controller_start_interval = Duration::from_millis(1);
    config.generic.shutdown_timeout = Duration::from_secs(5);

    let mut operator = Operator::new(config);
    operator.register(
        ControllerDescriptor::new(
            demo_config(),
            cluster.clone() as Arc<dyn ResourceGateway<TestResource>>,
            reconciler.clone() as Arc<dyn Reconciler<TestResource>>,
        )
        .unwrap(),
    );
    assert_eq!(operator.registry().len(), 1);

    let shutdown = operator.shutdown_token();
    let handle = tokio::spawn(async move { operator.run().await });

    // The relist replays the seeded object as an upsert.
    wait_until(|| reconciler.calls() == vec!["apply:u-1@7"]).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

/// Registered metadata stays queryable for manifest generation.
#[test]
fn registry_exposes_resource_metadata() {
    let cluster = Arc::new(InMemoryCluster::default());
    let reconciler = Arc::new(CountingReconciler::default());

    let mut operator = Operator::new(OperatorConfig::default());
    operator.register(
        ControllerDescriptor::new(
            demo_config(),
            cluster.clone() as Arc<dyn ResourceGateway<TestResource>>,
            reconciler.clone() as Arc<dyn Reconciler<TestResource>>,
        )
        .unwrap(),
    );

    let configs = operator.registry().resource_configs();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].api_version(), "example.com/v1");
    assert_eq!(configs[0].plural, "demos");
    assert_eq!(configs[0].finalizer_name(), FINALIZER);
    assert!(!configs[0].cluster_scoped);
}

/// Registering the same resource type twice is a programming error.
#[test]
#[should_panic(expected = "already registered")]
fn duplicate_registration_panics() {
    let cluster = Arc::new(InMemoryCluster::default());
    let reconciler = Arc::new(CountingReconciler::default());

    let mut operator = Operator::new(OperatorConfig::default());
    operator.register(
        ControllerDescriptor::new(
            demo_config(),
            cluster.clone() as Arc<dyn ResourceGateway<TestResource>>,
            reconciler.clone() as Arc<dyn Reconciler<TestResource>>,
        )
        .unwrap(),
    );
    operator.register(
        ControllerDescriptor::new(
            demo_config(),
            cluster.clone() as Arc<dyn ResourceGateway<TestResource>>,
            reconciler.clone() as Arc<dyn Reconciler<TestResource>>,
        )
        .unwrap(),
    );
}
