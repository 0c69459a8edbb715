//! ec2-operator: keeps EC2 instances in line with Ec2Instance resources
//!
//! The reconciler in [`controller`] drives each object through
//! provisioning, verification and cleanup. It only talks to the outside
//! world through two capabilities: [`store::ObjectStore`] for the declared
//! objects and [`cloud::CloudProvider`] for the instances themselves.

pub mod cloud;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod rest_api;
pub mod store;

pub use error::{Error, Result};
