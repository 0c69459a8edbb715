//! End-to-end runs of the controller over the in-memory store and cloud

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ec2_operator::cloud::SimulatedCloud;
use ec2_operator::controller::{
    run_controller, ControllerState, ReconcileTimings, RunnerSettings, EC2_INSTANCE_FINALIZER,
};
use ec2_operator::crd::{Ec2Instance, Ec2InstanceSpec, InstanceState};
use ec2_operator::store::{MemoryStore, ObjectKey, ObjectStore};
use kube::ResourceExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    store: Arc<MemoryStore>,
    cloud: Arc<SimulatedCloud>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<ec2_operator::Result<()>>,
}

impl Running {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(SimulatedCloud::new().with_auto_boot());
        let timings = ReconcileTimings {
            post_create_requeue: Duration::from_millis(10),
            steady_state_interval: Duration::from_millis(20),
            cloud_call_timeout: Duration::from_secs(1),
        };
        let settings = RunnerSettings {
            workers: 2,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
        };

        let state = Arc::new(ControllerState::new(store.clone(), cloud.clone(), timings));
        let events = store.subscribe().await;
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(run_controller(state, settings, events, async move {
            let _ = stopped.await;
        }));

        Self {
            store,
            cloud,
            stop,
            handle,
        }
    }

    async fn object(&self, key: &ObjectKey) -> Option<Ec2Instance> {
        self.store.get(key).await.unwrap()
    }

    /// Poll the object until `check` holds, for at most five seconds
    async fn wait_for(&self, key: &ObjectKey, what: &str, check: impl Fn(Option<&Ec2Instance>) -> bool) {
        for _ in 0..500 {
            if check(self.object(key).await.as_ref()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} on {}", what, key);
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

fn instance(name: &str) -> Ec2Instance {
    Ec2Instance::new(
        name,
        Ec2InstanceSpec {
            image_id: "ami-0abcdef1234567890".to_string(),
            region: "us-east-1".to_string(),
            key_pair: "ops".to_string(),
            instance_type: "t3.small".to_string(),
            subnet: String::new(),
            tags: BTreeMap::from([("env".to_string(), "test".to_string())]),
        },
    )
}

fn is_running(obj: Option<&Ec2Instance>) -> bool {
    obj.is_some_and(|o| o.observed_state() == InstanceState::Running)
}

#[tokio::test]
async fn test_instance_lifecycle() {
    let op = Running::start().await;
    let key = op.store.apply(instance("web-1")).await;

    op.wait_for(&key, "instance to be running", is_running).await;

    let obj = op.object(&key).await.unwrap();
    let instance_id = obj.instance_id().to_string();
    let status = obj.status.clone().unwrap();
    assert!(obj.finalizers().iter().any(|f| f == EC2_INSTANCE_FINALIZER));
    assert!(!status.public_ip.is_empty());
    assert!(!status.private_ip.is_empty());
    assert_eq!(op.cloud.create_calls().await, 1);

    op.store.request_deletion(&key).await.unwrap();
    op.wait_for(&key, "object to be removed", |o| o.is_none()).await;

    assert!(matches!(
        op.cloud.instance_state(&instance_id).await,
        Some(InstanceState::ShuttingDown | InstanceState::Terminated)
    ));
    assert_eq!(op.cloud.create_calls().await, 1);

    op.stop().await;
}

#[tokio::test]
async fn test_vanished_instance_is_replaced() {
    let op = Running::start().await;
    let key = op.store.apply(instance("web-1")).await;

    op.wait_for(&key, "instance to be running", is_running).await;
    let first = op.object(&key).await.unwrap().instance_id().to_string();

    op.cloud.remove(&first).await;

    op.wait_for(&key, "replacement instance to be running", |o| {
        o.is_some_and(|o| !o.instance_id().is_empty() && o.instance_id() != first)
            && is_running(o)
    })
    .await;
    assert_eq!(op.cloud.create_calls().await, 2);
    assert_eq!(op.cloud.live_instances().await, 1);

    op.stop().await;
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let op = Running::start().await;
    op.cloud.fail_next_creates(2).await;
    let key = op.store.apply(instance("web-1")).await;

    op.wait_for(&key, "instance to be launched", |o| {
        o.is_some_and(|o| !o.instance_id().is_empty())
    })
    .await;
    assert_eq!(op.cloud.create_calls().await, 3);
    assert_eq!(op.cloud.live_instances().await, 1);

    op.stop().await;
}

#[tokio::test]
async fn test_many_objects_each_get_one_instance() {
    let op = Running::start().await;
    let mut keys = Vec::new();
    for i in 0..5 {
        keys.push(op.store.apply(instance(&format!("web-{}", i))).await);
    }

    for key in &keys {
        op.wait_for(key, "instance to be running", is_running).await;
    }

    assert_eq!(op.cloud.create_calls().await, 5);
    assert_eq!(op.cloud.live_instances().await, 5);

    op.stop().await;
}

#[tokio::test]
async fn test_describe_errors_back_off_then_converge() {
    let op = Running::start().await;
    op.cloud.fail_next_describes(3).await;
    let key = op.store.apply(instance("web-1")).await;

    op.wait_for(&key, "instance to be running", is_running).await;

    // Three failed describes plus the one that succeeded
    assert!(op.cloud.describe_calls().await >= 4);
    assert_eq!(op.cloud.create_calls().await, 1);
    assert_eq!(op.cloud.live_instances().await, 1);

    op.stop().await;
}
