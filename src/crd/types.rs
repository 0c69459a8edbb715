//! Shared types for Ec2Instance status and lifecycle
//!
//! These types are used across the CRD definitions, the cloud provider
//! clients and the controller logic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Instance state as reported by the cloud provider.
///
/// Well-known EC2 states get their own variant; anything else is kept
/// verbatim in `Other` so the status always mirrors what the provider said.
/// Serialized as the plain provider string (`""` for `Empty`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum InstanceState {
    /// Nothing observed yet
    #[default]
    Empty,
    Pending,
    Running,
    ShuttingDown,
    Stopping,
    Stopped,
    Terminated,
    /// Any state string the operator does not model explicitly
    Other(String),
}

impl InstanceState {
    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Empty => "",
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
            InstanceState::Other(raw) => raw,
        }
    }

    /// True when the provider considers the instance gone for good
    pub fn is_terminated(&self) -> bool {
        matches!(self, InstanceState::Terminated)
    }
}

impl From<&str> for InstanceState {
    fn from(raw: &str) -> Self {
        match raw {
            "" => InstanceState::Empty,
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            "terminated" => InstanceState::Terminated,
            other => InstanceState::Other(other.to_string()),
        }
    }
}

impl From<String> for InstanceState {
    fn from(raw: String) -> Self {
        InstanceState::from(raw.as_str())
    }
}

impl From<InstanceState> for String {
    fn from(state: InstanceState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network addresses assigned to an instance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceAddresses {
    pub public_ip: String,
    pub private_ip: String,
    pub public_dns: String,
    pub private_dns: String,
}

impl InstanceAddresses {
    pub fn is_empty(&self) -> bool {
        self.public_ip.is_empty()
            && self.private_ip.is_empty()
            && self.public_dns.is_empty()
            && self.private_dns.is_empty()
    }
}

/// Lifecycle phase of an Ec2Instance, derived from its observable fields.
///
/// Never persisted. `Absent` is represented by the object missing from the
/// store, so it has no variant here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstancePhase {
    /// Deletion requested; only termination and finalizer release happen
    Deleting,
    /// No instance id recorded yet
    Provisioning,
    /// Instance id recorded; existence and state are re-verified
    Verifying,
}

impl fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstancePhase::Deleting => write!(f, "Deleting"),
            InstancePhase::Provisioning => write!(f, "Provisioning"),
            InstancePhase::Verifying => write!(f, "Verifying"),
        }
    }
}
