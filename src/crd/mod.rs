//! Custom Resource Definitions for the ec2-operator
//!
//! This module defines the Kubernetes CRD for managing EC2 instances.

mod ec2_instance;
mod types;


pub use ec2_instance::{Ec2Instance, Ec2InstanceSpec, Ec2InstanceStatus};
pub use types::*;
