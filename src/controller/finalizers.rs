//! Finalizer for Ec2Instance resources

use kube::ResourceExt;

use crate::crd::Ec2Instance;
use crate::store::MarkerUpdate;

/// Blocks removal of an Ec2Instance until its EC2 instance is terminated
pub const EC2_INSTANCE_FINALIZER: &str = "ec2instance.compute.cloud.com";

pub fn has_finalizer(instance: &Ec2Instance) -> bool {
    instance
        .finalizers()
        .iter()
        .any(|f| f == EC2_INSTANCE_FINALIZER)
}

pub fn attach() -> MarkerUpdate {
    MarkerUpdate::AddFinalizer(EC2_INSTANCE_FINALIZER.to_string())
}

pub fn release() -> MarkerUpdate {
    MarkerUpdate::RemoveFinalizer(EC2_INSTANCE_FINALIZER.to_string())
}
