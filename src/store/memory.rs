//! In-process store with Kubernetes-like deletion semantics
//!
//! Objects with finalizers are only marked for deletion; they disappear
//! once the last finalizer is released. Every mutation is announced to
//! subscribers, including the store's own status writes, which is what
//! keeps the reconcile loop level-triggered when running in-process.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::{stream, Stream};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{MarkerUpdate, ObjectKey, ObjectStore};
use crate::crd::{Ec2Instance, Ec2InstanceStatus};
use crate::error::{Error, Result};

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<ObjectKey, Ec2Instance>,
    revision: u64,
    writes: u64,
    failing_marker_updates: u32,
    failing_status_updates: u32,
    subscribers: Vec<mpsc::UnboundedSender<ObjectKey>>,
}

impl MemoryState {
    fn bump(&mut self, key: &ObjectKey) {
        self.revision += 1;
        let revision = self.revision.to_string();
        if let Some(obj) = self.objects.get_mut(key) {
            obj.metadata.resource_version = Some(revision);
        }
        self.subscribers.retain(|tx| tx.send(key.clone()).is_ok());
    }
}

/// `ObjectStore` held entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update an object the way a user would.
    ///
    /// New objects are stored as given (status included, which lets tests
    /// seed any starting point). Existing objects only take the new spec.
    pub async fn apply(&self, mut obj: Ec2Instance) -> ObjectKey {
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some("default".to_string());
        }
        let key = ObjectKey::from_resource(&obj);

        let mut state = self.state.lock().await;
        match state.objects.entry(key.clone()) {
            Entry::Occupied(mut existing) => existing.get_mut().spec = obj.spec,
            Entry::Vacant(slot) => {
                slot.insert(obj);
            }
        }
        state.bump(&key);
        key
    }

    /// Ask for removal; the object lingers while finalizers remain
    pub async fn request_deletion(&self, key: &ObjectKey) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(obj) = state.objects.get_mut(key) else {
            return Err(not_found(key));
        };

        let has_finalizers = obj
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());

        if has_finalizers {
            if obj.metadata.deletion_timestamp.is_none() {
                obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            }
            state.bump(key);
        } else {
            state.objects.remove(key);
            debug!("Removed {} from memory store", key);
            state.subscribers.retain(|tx| tx.send(key.clone()).is_ok());
        }
        Ok(())
    }

    /// Stream of keys, one per mutation from now on
    pub async fn subscribe(&self) -> impl Stream<Item = ObjectKey> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.subscribers.push(tx);
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|key| (key, rx)) })
    }

    /// Number of successful marker and status writes so far
    pub async fn write_count(&self) -> u64 {
        self.state.lock().await.writes
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make the next `n` finalizer updates fail
    pub async fn fail_next_marker_updates(&self, n: u32) {
        self.state.lock().await.failing_marker_updates = n;
    }

    /// Make the next `n` status updates fail
    pub async fn fail_next_status_updates(&self, n: u32) {
        self.state.lock().await.failing_status_updates = n;
    }
}

fn not_found(key: &ObjectKey) -> Error {
    Error::NotFound {
        kind: "Ec2Instance".to_string(),
        name: key.name.clone(),
        namespace: key.namespace.clone(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Ec2Instance>> {
        Ok(self.state.lock().await.objects.get(key).cloned())
    }

    async fn update_markers(&self, key: &ObjectKey, update: MarkerUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_marker_updates > 0 {
            state.failing_marker_updates -= 1;
            return Err(Error::StoreError(format!(
                "injected finalizer update failure for {}",
                key
            )));
        }

        let Some(obj) = state.objects.get_mut(key) else {
            return match update {
                MarkerUpdate::RemoveFinalizer(_) => Ok(()),
                MarkerUpdate::AddFinalizer(_) => Err(not_found(key)),
            };
        };

        let finalizers = obj.metadata.finalizers.get_or_insert_with(Vec::new);
        if !update.apply(finalizers) {
            return Ok(());
        }
        let released = finalizers.is_empty() && obj.metadata.deletion_timestamp.is_some();

        state.writes += 1;
        if released {
            state.objects.remove(key);
            debug!("Last finalizer released, removed {} from memory store", key);
        }
        state.bump(key);
        Ok(())
    }

    async fn update_status(&self, key: &ObjectKey, status: &Ec2InstanceStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failing_status_updates > 0 {
            state.failing_status_updates -= 1;
            return Err(Error::StoreError(format!(
                "injected status update failure for {}",
                key
            )));
        }

        let Some(obj) = state.objects.get_mut(key) else {
            return Err(not_found(key));
        };
        obj.status = Some(status.clone());
        state.writes += 1;
        state.bump(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::crd::Ec2InstanceSpec;

    const TOKEN: &str = "ec2instance.compute.cloud.com";

    fn instance(name: &str) -> Ec2Instance {
        Ec2Instance::new(
            name,
            Ec2InstanceSpec {
                image_id: "ami-1".to_string(),
                region: "eu-west-1".to_string(),
                key_pair: String::new(),
                instance_type: "t3.micro".to_string(),
                subnet: String::new(),
                tags: Default::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_deletion_waits_for_finalizers() {
        let store = MemoryStore::new();
        let key = store.apply(instance("web-1")).await;
        store
            .update_markers(&key, MarkerUpdate::AddFinalizer(TOKEN.to_string()))
            .await
            .unwrap();

        store.request_deletion(&key).await.unwrap();
        let obj = store.get(&key).await.unwrap().unwrap();
        assert!(obj.is_deleting());

        store
            .update_markers(&key, MarkerUpdate::RemoveFinalizer(TOKEN.to_string()))
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletion_without_finalizers_is_immediate() {
        let store = MemoryStore::new();
        let key = store.apply(instance("web-1")).await;
        store.request_deletion(&key).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_every_mutation_is_announced() {
        let store = MemoryStore::new();
        let mut events = Box::pin(store.subscribe().await);

        let key = store.apply(instance("web-1")).await;
        store
            .update_status(&key, &Ec2InstanceStatus::default())
            .await
            .unwrap();

        assert_eq!(events.next().await, Some(key.clone()));
        assert_eq!(events.next().await, Some(key));
    }

    #[tokio::test]
    async fn test_apply_keeps_status_of_existing_object() {
        let store = MemoryStore::new();
        let key = store.apply(instance("web-1")).await;
        let status = Ec2InstanceStatus {
            instance_id: "i-1".to_string(),
            ..Default::default()
        };
        store.update_status(&key, &status).await.unwrap();

        let mut changed = instance("web-1");
        changed.spec.instance_type = "t3.large".to_string();
        store.apply(changed).await;

        let obj = store.get(&key).await.unwrap().unwrap();
        assert_eq!(obj.instance_id(), "i-1");
        assert_eq!(obj.spec.instance_type, "t3.large");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        let key = store.apply(instance("web-1")).await;
        store.fail_next_marker_updates(1).await;

        let add = MarkerUpdate::AddFinalizer(TOKEN.to_string());
        assert!(store.update_markers(&key, add.clone()).await.is_err());
        assert!(store.update_markers(&key, add).await.is_ok());
        assert_eq!(store.write_count().await, 1);
    }
}
