//! Cloud provider capability
//!
//! The reconciler launches, inspects and terminates instances through
//! [`CloudProvider`]. `ec2` talks to AWS; `simulated` keeps instances in
//! memory for tests and local clusters without AWS credentials.

pub mod ec2;
pub mod simulated;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Ec2InstanceSpec, InstanceAddresses, InstanceState};
use crate::error::Result;

pub use ec2::Ec2Provider;
pub use simulated::SimulatedCloud;

/// What the provider returned for a freshly launched instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub state: InstanceState,
    pub addresses: InstanceAddresses,
}

/// Current view of an existing instance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceDescription {
    pub state: InstanceState,
    pub addresses: InstanceAddresses,
}

/// Trait abstracting the instance lifecycle operations of a cloud API
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Launch one instance for the given spec.
    ///
    /// Repeating a call with the same `client_token` must not launch a
    /// second instance; the provider returns the one it already started.
    async fn create(&self, spec: &Ec2InstanceSpec, client_token: &str) -> Result<InstanceRecord>;

    /// Look up an instance; `Ok(None)` means the provider does not know it
    async fn describe(&self, region: &str, instance_id: &str)
        -> Result<Option<InstanceDescription>>;

    /// Terminate an instance; terminating an unknown id should succeed
    async fn terminate(&self, region: &str, instance_id: &str) -> Result<()>;
}
