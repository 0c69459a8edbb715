//! Controller module for Ec2Instance reconciliation
//!
//! This module contains the controller loop, the keyed work queue, and the
//! reconciliation state machine that keeps EC2 instances in line with their
//! Ec2Instance resources.

pub mod finalizers;
pub mod metrics;
mod reconciler;
mod runner;
pub mod workqueue;

pub use finalizers::EC2_INSTANCE_FINALIZER;
pub use reconciler::{reconcile, ControllerState, Directive, ReconcileTimings};
pub use runner::{run_controller, RunnerSettings};
pub use workqueue::{calculate_backoff, WorkQueue};
