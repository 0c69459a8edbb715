//! Kubernetes-backed store and watch stream

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{watcher, WatchStreamExt},
    ResourceExt,
};
use tracing::{debug, error, info, warn};

use super::{MarkerUpdate, ObjectKey, ObjectStore};
use crate::crd::{Ec2Instance, Ec2InstanceStatus};
use crate::error::{Error, Result};

/// Field manager recorded on every patch
pub const FIELD_MANAGER: &str = "ec2-operator";

const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// `ObjectStore` over the Kubernetes API.
///
/// Reads always go to the API server rather than a cache so a reconcile
/// never acts on a status older than its own last write.
pub struct KubeStore {
    client: Client,
    conflict_retries: u32,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    fn api(&self, namespace: &str) -> Api<Ec2Instance> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Ec2Instance>> {
        match self.api(&key.namespace).get(&key.name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn update_markers(&self, key: &ObjectKey, update: MarkerUpdate) -> Result<()> {
        let api = self.api(&key.namespace);

        for attempt in 1..=self.conflict_retries {
            let Some(obj) = self.get(key).await? else {
                return match update {
                    // Nothing left to release
                    MarkerUpdate::RemoveFinalizer(_) => Ok(()),
                    MarkerUpdate::AddFinalizer(_) => Err(Error::NotFound {
                        kind: "Ec2Instance".to_string(),
                        name: key.name.clone(),
                        namespace: key.namespace.clone(),
                    }),
                };
            };

            let mut finalizers = obj.finalizers().to_vec();
            if !update.apply(&mut finalizers) {
                return Ok(());
            }

            // resourceVersion turns the merge patch into a conditional write
            let patch = serde_json::json!({
                "metadata": {
                    "finalizers": finalizers,
                    "resourceVersion": obj.resource_version(),
                }
            });

            match api
                .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if is_status(&e, 409) => {
                    debug!(attempt, "Finalizer update on {} conflicted, retrying", key);
                }
                Err(e) if is_status(&e, 404) => {
                    if let MarkerUpdate::RemoveFinalizer(_) = update {
                        return Ok(());
                    }
                    return Err(Error::KubeError(e));
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }

        Err(Error::Conflict {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            attempts: self.conflict_retries,
        })
    }

    async fn update_status(&self, key: &ObjectKey, status: &Ec2InstanceStatus) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }
}

/// Stream of keys for every Ec2Instance that is added, modified or deleted.
///
/// Watch errors are logged and the watcher re-establishes itself with
/// kube-runtime's default backoff.
pub fn watch_keys(client: Client, namespace: Option<&str>) -> impl Stream<Item = ObjectKey> + Send {
    let api = scoped_api(client, namespace);

    watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .filter_map(|event| async move {
            match event {
                Ok(obj) => Some(ObjectKey::from_resource(&obj)),
                Err(e) => {
                    warn!("Ec2Instance watch error: {}", e);
                    None
                }
            }
        })
}

/// Ec2Instance API limited to one namespace, or cluster-wide when unset
fn scoped_api(client: Client, namespace: Option<&str>) -> Api<Ec2Instance> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Fail fast when the Ec2Instance CRD has not been applied to the cluster.
///
/// Lists within the watched namespace so namespaced RBAC is enough.
pub async fn ensure_crd_installed(client: &Client, namespace: Option<&str>) -> Result<()> {
    let api = scoped_api(client.clone(), namespace);
    match api.list(&ListParams::default().limit(1)).await {
        Ok(_) => {
            info!("Ec2Instance CRD is available");
            Ok(())
        }
        Err(e) => {
            error!(
                "Ec2Instance CRD not found. Install it with `ec2-operator crd | kubectl apply -f -`: {:?}",
                e
            );
            Err(Error::ConfigError(
                "Ec2Instance CRD not installed".to_string(),
            ))
        }
    }
}
