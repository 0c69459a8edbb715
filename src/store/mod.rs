//! Desired-state store capability
//!
//! The reconciler only ever reads one object, patches its finalizers, or
//! patches its status. Those three operations are all this trait exposes,
//! so the controller can run against Kubernetes or an in-process store.

pub mod kubernetes;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use kube::ResourceExt;

use crate::crd::{Ec2Instance, Ec2InstanceStatus};
use crate::error::Result;

pub use kubernetes::{ensure_crd_installed, watch_keys, KubeStore};
pub use memory::MemoryStore;

/// Namespace/name pair identifying one Ec2Instance
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object, falling back to the "default" namespace
    pub fn from_resource(obj: &Ec2Instance) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_else(|| "default".to_string()),
            name: obj.name_any(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A change to an object's lifecycle markers.
///
/// Expressed as an intent rather than a full list so the store can
/// re-apply it on top of a fresh read after a write conflict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarkerUpdate {
    AddFinalizer(String),
    RemoveFinalizer(String),
}

impl MarkerUpdate {
    /// Apply to a finalizer list, returning whether anything changed
    pub fn apply(&self, finalizers: &mut Vec<String>) -> bool {
        match self {
            MarkerUpdate::AddFinalizer(token) => {
                if finalizers.iter().any(|f| f == token) {
                    false
                } else {
                    finalizers.push(token.clone());
                    true
                }
            }
            MarkerUpdate::RemoveFinalizer(token) => {
                let before = finalizers.len();
                finalizers.retain(|f| f != token);
                finalizers.len() != before
            }
        }
    }
}

/// Narrow view of the declarative store used by the reconciler
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the current object, `None` when it no longer exists
    async fn get(&self, key: &ObjectKey) -> Result<Option<Ec2Instance>>;

    /// Add or remove a finalizer, retrying write conflicts internally
    async fn update_markers(&self, key: &ObjectKey, update: MarkerUpdate) -> Result<()>;

    /// Replace the status subresource
    async fn update_status(&self, key: &ObjectKey, status: &Ec2InstanceStatus) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_finalizer_is_idempotent() {
        let update = MarkerUpdate::AddFinalizer("a".to_string());
        let mut finalizers = vec![];
        assert!(update.apply(&mut finalizers));
        assert!(!update.apply(&mut finalizers));
        assert_eq!(finalizers, vec!["a".to_string()]);
    }

    #[test]
    fn test_remove_finalizer_keeps_others() {
        let update = MarkerUpdate::RemoveFinalizer("a".to_string());
        let mut finalizers = vec!["other".to_string(), "a".to_string()];
        assert!(update.apply(&mut finalizers));
        assert_eq!(finalizers, vec!["other".to_string()]);
        assert!(!update.apply(&mut finalizers));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ObjectKey::new("prod", "web-1").to_string(), "prod/web-1");
    }
}
