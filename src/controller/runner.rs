//! Controller main loop
//!
//! Change notifications feed a [`WorkQueue`]; a fixed pool of workers takes
//! keys from it, reconciles them and schedules the follow-up the reconciler
//! asked for (or a backoff when it failed).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::metrics;
use super::reconciler::{reconcile, ControllerState, Directive};
use super::workqueue::WorkQueue;
use crate::error::{Error, Result};
use crate::store::ObjectKey;

/// Worker pool and retry settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunnerSettings {
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Run the controller until `shutdown` completes or the notification stream ends
pub async fn run_controller<S, F>(
    state: Arc<ControllerState>,
    settings: RunnerSettings,
    notifications: S,
    shutdown: F,
) -> Result<()>
where
    S: Stream<Item = ObjectKey> + Send,
    F: Future<Output = ()> + Send,
{
    if settings.workers == 0 {
        return Err(Error::ConfigError(
            "controller needs at least one worker".to_string(),
        ));
    }

    info!(workers = settings.workers, "Starting Ec2Instance controller");

    let queue = Arc::new(WorkQueue::new(settings.backoff_base, settings.backoff_max));
    let mut workers = JoinSet::new();
    for id in 0..settings.workers {
        workers.spawn(worker_loop(
            id,
            state.clone(),
            queue.clone(),
            settings.backoff_max,
        ));
    }

    let notifications = notifications.for_each(|key| {
        debug!("Change notification for {}", key);
        queue.add(key);
        metrics::set_queue_depth(queue.len());
        futures::future::ready(())
    });

    tokio::select! {
        _ = notifications => warn!("Notification stream ended, stopping controller"),
        _ = shutdown => info!("Shutdown requested, stopping controller"),
    }

    queue.shutdown();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("Controller worker panicked: {}", e);
        }
    }

    info!("Ec2Instance controller stopped");
    Ok(())
}

async fn worker_loop(
    id: usize,
    state: Arc<ControllerState>,
    queue: Arc<WorkQueue<ObjectKey>>,
    backoff_max: Duration,
) {
    debug!(worker = id, "Worker started");

    while let Some(key) = queue.next().await {
        let result = reconcile(&key, &state).await;
        queue.done(&key);

        match result {
            Ok(Directive::Done) => {
                metrics::record_reconcile("done");
                queue.forget(&key);
            }
            Ok(Directive::RequeueAfter(delay)) => {
                metrics::record_reconcile("requeue");
                queue.forget(&key);
                queue.add_after(key, delay);
            }
            Err(e) => {
                metrics::record_reconcile(e.metric_label());
                let delay = error_policy(&queue, key.clone(), &e, backoff_max);
                warn!("Reconciliation of {} failed, retrying in {:?}: {}", key, delay, e);
            }
        }

        metrics::set_queue_depth(queue.len());
    }

    debug!(worker = id, "Worker stopped");
}

/// Schedule a retry for a failed reconcile and return its delay
///
/// Retriable errors back off exponentially per key. Errors that won't fix
/// themselves (invalid spec, bad configuration) are retried at the slowest
/// rate so an edited object is still picked up eventually.
fn error_policy(
    queue: &WorkQueue<ObjectKey>,
    key: ObjectKey,
    error: &Error,
    backoff_max: Duration,
) -> Duration {
    if error.is_retriable() {
        queue.add_rate_limited(key)
    } else {
        queue.add_after(key, backoff_max);
        backoff_max
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use futures::stream;

    use super::*;
    use crate::cloud::SimulatedCloud;
    use crate::controller::ReconcileTimings;
    use crate::crd::{Ec2Instance, Ec2InstanceSpec};
    use crate::store::{MemoryStore, ObjectStore};

    fn instance(name: &str) -> Ec2Instance {
        Ec2Instance::new(
            name,
            Ec2InstanceSpec {
                image_id: "ami-1".to_string(),
                region: "eu-west-1".to_string(),
                key_pair: String::new(),
                instance_type: "t3.micro".to_string(),
                subnet: String::new(),
                tags: BTreeMap::new(),
            },
        )
    }

    fn controller_state(store: Arc<MemoryStore>, cloud: Arc<SimulatedCloud>) -> Arc<ControllerState> {
        Arc::new(ControllerState::new(
            store,
            cloud,
            ReconcileTimings::default(),
        ))
    }

    #[test]
    fn test_error_policy_backs_off_retriable_errors() {
        let queue = WorkQueue::new(Duration::from_secs(1), Duration::from_secs(300));
        let key = ObjectKey::new("default", "web-1");
        let err = Error::cloud("create", "throttled");

        let first = error_policy(&queue, key.clone(), &err, Duration::from_secs(300));
        let second = error_policy(&queue, key.clone(), &err, Duration::from_secs(300));
        assert_eq!(first, Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(2));
    }

    #[test]
    fn test_error_policy_parks_invalid_objects() {
        let queue = WorkQueue::new(Duration::from_secs(1), Duration::from_secs(300));
        let key = ObjectKey::new("default", "web-1");
        let err = Error::ValidationError("imageId must not be empty".to_string());

        let delay = error_policy(&queue, key.clone(), &err, Duration::from_secs(300));
        assert_eq!(delay, Duration::from_secs(300));
        assert_eq!(queue.failures(&key), 0);
    }

    #[tokio::test]
    async fn test_zero_workers_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(SimulatedCloud::new());
        let settings = RunnerSettings {
            workers: 0,
            ..Default::default()
        };

        let result = run_controller(
            controller_state(store, cloud),
            settings,
            stream::empty(),
            futures::future::ready(()),
        )
        .await;
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_notifications_drive_provisioning() {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(SimulatedCloud::new());
        let key = store.apply(instance("web-1")).await;
        let events = store.subscribe().await;

        let state = controller_state(store.clone(), cloud.clone());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(run_controller(
            state,
            RunnerSettings::default(),
            stream::iter(vec![key.clone()]).chain(events),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let mut provisioned = false;
        for _ in 0..200 {
            let obj = store.get(&key).await.unwrap().unwrap();
            if !obj.instance_id().is_empty() {
                provisioned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = stop_tx.send(());
        handle.await.unwrap().unwrap();

        assert!(provisioned);
        assert_eq!(cloud.create_calls().await, 1);
    }
}
