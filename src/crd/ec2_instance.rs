//! Ec2Instance Custom Resource Definition
//!
//! The Ec2Instance CRD represents a single EC2 compute instance whose
//! lifecycle is owned by the operator.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{InstanceAddresses, InstancePhase, InstanceState};

/// The Ec2Instance CRD represents a desired EC2 instance.
///
/// The spec is write-once: changing it after the instance was launched
/// does not modify the running instance.
///
/// # Example
///
/// ```yaml
/// apiVersion: compute.cloud.com/v1
/// kind: Ec2Instance
/// metadata:
///   name: web-1
///   namespace: default
/// spec:
///   imageId: ami-0abcdef1234567890
///   region: eu-west-1
///   keyPair: ops
///   instanceType: t3.micro
///   subnet: subnet-0123456789abcdef0
///   tags:
///     team: platform
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "compute.cloud.com",
    version = "v1",
    kind = "Ec2Instance",
    namespaced,
    status = "Ec2InstanceStatus",
    shortname = "ec2",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".status.instanceId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Public IP","type":"string","jsonPath":".status.publicIp"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct Ec2InstanceSpec {
    /// AMI to launch (e.g., "ami-0abcdef1234567890")
    pub image_id: String,

    /// AWS region the instance lives in
    pub region: String,

    /// Name of the EC2 key pair installed on the instance
    #[serde(default)]
    pub key_pair: String,

    /// EC2 instance type (e.g., "t3.micro")
    pub instance_type: String,

    /// Subnet to launch into; the default VPC is used when empty
    #[serde(default)]
    pub subnet: String,

    /// Tags applied to the instance at launch
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Ec2InstanceSpec {
    /// Validate the fields the cloud provider cannot launch without
    pub fn validate(&self) -> Result<(), String> {
        if self.image_id.trim().is_empty() {
            return Err("imageId must not be empty".to_string());
        }
        if self.region.trim().is_empty() {
            return Err("region must not be empty".to_string());
        }
        if self.instance_type.trim().is_empty() {
            return Err("instanceType must not be empty".to_string());
        }
        if self.tags.keys().any(|k| k.trim().is_empty()) {
            return Err("tags must not contain an empty key".to_string());
        }
        Ok(())
    }
}

/// Status subresource of an Ec2Instance.
///
/// Every field is always serialized so that a merge patch can reset
/// `instanceId` back to an empty string.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Ec2InstanceStatus {
    /// Cloud provider id of the instance; empty until creation succeeds
    #[serde(default)]
    pub instance_id: String,

    /// Last state reported by the provider (pending, running, terminated, ...)
    #[serde(default)]
    #[schemars(with = "String")]
    pub state: InstanceState,

    #[serde(default)]
    pub public_ip: String,

    #[serde(default)]
    pub private_ip: String,

    #[serde(default)]
    pub public_dns: String,

    #[serde(default)]
    pub private_dns: String,

    /// Times the instance was replaced after vanishing out-of-band
    #[serde(default)]
    pub recreations: u32,
}

impl Ec2InstanceStatus {
    /// Status recorded right after a successful launch
    pub fn launched(instance_id: &str, state: InstanceState, addresses: &InstanceAddresses) -> Self {
        let mut status = Self {
            instance_id: instance_id.to_string(),
            state,
            ..Default::default()
        };
        status.set_addresses(addresses);
        status
    }

    pub fn set_addresses(&mut self, addresses: &InstanceAddresses) {
        self.public_ip = addresses.public_ip.clone();
        self.private_ip = addresses.private_ip.clone();
        self.public_dns = addresses.public_dns.clone();
        self.private_dns = addresses.private_dns.clone();
    }

    /// Forget the instance after it vanished out-of-band.
    ///
    /// Addresses are cleared with it, and the next launch gets a fresh
    /// idempotency token.
    pub fn reset_for_recreation(&mut self) {
        self.instance_id.clear();
        self.state = InstanceState::Terminated;
        self.set_addresses(&InstanceAddresses::default());
        self.recreations = self.recreations.saturating_add(1);
    }
}

impl Ec2Instance {
    /// Instance id recorded in status, or "" when none
    pub fn instance_id(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.instance_id.as_str())
            .unwrap_or("")
    }

    /// Last observed provider state
    pub fn observed_state(&self) -> InstanceState {
        self.status
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or_default()
    }

    /// Idempotency token for launching this object's current instance.
    ///
    /// Stable across retries of one launch, different after every
    /// out-of-band replacement.
    pub fn launch_token(&self) -> String {
        let owner = self.metadata.uid.clone().unwrap_or_else(|| self.name_any());
        format!("{}-{}", owner, self.recreations())
    }

    pub fn recreations(&self) -> u32 {
        self.status.as_ref().map(|s| s.recreations).unwrap_or(0)
    }

    /// Whether the user asked the store to remove this object
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Derive the lifecycle phase from deletion marker and recorded id
    pub fn phase(&self) -> InstancePhase {
        if self.is_deleting() {
            InstancePhase::Deleting
        } else if self.instance_id().is_empty() {
            InstancePhase::Provisioning
        } else {
            InstancePhase::Verifying
        }
    }
}
