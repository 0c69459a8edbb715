//! Reconciliation state machine for Ec2Instance resources
//!
//! Every invocation re-derives what to do from the stored object and the
//! provider's answer, never from the notification that triggered it, so
//! duplicated, dropped or reordered notifications are harmless.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::cloud::CloudProvider;
use crate::crd::{Ec2Instance, Ec2InstanceStatus, InstancePhase};
use crate::error::{Error, Result};
use crate::store::{ObjectKey, ObjectStore};

use super::finalizers::{self, has_finalizer};
use super::metrics;

/// What the work queue should do with a key after a successful reconcile.
///
/// Failures are reported as `Err` and retried with backoff instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Wait for the next change notification
    Done,
    /// Reconcile again after the delay; zero means right away
    RequeueAfter(Duration),
}

impl Directive {
    pub fn requeue_now() -> Self {
        Directive::RequeueAfter(Duration::ZERO)
    }
}

/// Tunable delays used by the state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcileTimings {
    /// Requeue after a launch, to pick up pending -> running quickly
    pub post_create_requeue: Duration,
    /// Health check period once the instance is in sync
    pub steady_state_interval: Duration,
    /// Upper bound on any single cloud provider call
    pub cloud_call_timeout: Duration,
}

impl Default for ReconcileTimings {
    fn default() -> Self {
        Self {
            post_create_requeue: Duration::from_secs(1),
            steady_state_interval: Duration::from_secs(30),
            cloud_call_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared state for the controller
pub struct ControllerState {
    pub store: Arc<dyn ObjectStore>,
    pub cloud: Arc<dyn CloudProvider>,
    pub timings: ReconcileTimings,
}

impl ControllerState {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        cloud: Arc<dyn CloudProvider>,
        timings: ReconcileTimings,
    ) -> Self {
        Self {
            store,
            cloud,
            timings,
        }
    }

    /// Run a provider call under the configured timeout
    async fn bounded<T>(&self, operation: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.timings.cloud_call_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Error::Timeout {
                operation: operation.to_string(),
                timeout,
            })?
    }
}

/// The main reconciliation function
///
/// Called by the work queue whenever:
/// - an Ec2Instance is created, updated, or deleted (including our own writes)
/// - a requeue timer expires
/// - a previous attempt failed and its backoff elapsed
#[instrument(skip(key, ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile(key: &ObjectKey, ctx: &ControllerState) -> Result<Directive> {
    let Some(instance) = ctx.store.get(key).await? else {
        debug!("Ec2Instance {} no longer exists, nothing to reconcile", key);
        return Ok(Directive::Done);
    };

    let phase = instance.phase();
    debug!(
        %phase,
        instance_id = instance.instance_id(),
        "Reconciling Ec2Instance {}",
        key
    );

    match phase {
        InstancePhase::Deleting => cleanup_instance(key, &instance, ctx).await,
        InstancePhase::Provisioning => provision_instance(key, &instance, ctx).await,
        InstancePhase::Verifying => verify_instance(key, &instance, ctx).await,
    }
}

/// Terminate the EC2 instance, then release the finalizer
async fn cleanup_instance(
    key: &ObjectKey,
    instance: &Ec2Instance,
    ctx: &ControllerState,
) -> Result<Directive> {
    let instance_id = instance.instance_id();

    if !instance_id.is_empty() {
        info!("Terminating EC2 instance {} for {}", instance_id, key);
        ctx.bounded(
            "terminate",
            ctx.cloud.terminate(&instance.spec.region, instance_id),
        )
        .await
        .inspect_err(|e| error!("Failed to terminate EC2 instance {}: {}", instance_id, e))?;
        metrics::record_termination(key);
    }

    if has_finalizer(instance) {
        ctx.store.update_markers(key, finalizers::release()).await?;
        info!("Finalizer released, {} can now be removed", key);
    }

    Ok(Directive::Done)
}

/// Attach the finalizer, then launch the instance and record it
async fn provision_instance(
    key: &ObjectKey,
    instance: &Ec2Instance,
    ctx: &ControllerState,
) -> Result<Directive> {
    let spec = &instance.spec;
    if let Err(e) = spec.validate() {
        warn!("Validation failed for {}: {}", key, e);
        return Err(Error::ValidationError(e));
    }

    // Persisted before launching so a crash after create still leads to cleanup
    if !has_finalizer(instance) {
        info!("Attaching finalizer to {}", key);
        ctx.store.update_markers(key, finalizers::attach()).await?;
    }

    info!(
        image = %spec.image_id,
        instance_type = %spec.instance_type,
        region = %spec.region,
        "Creating EC2 instance for {}",
        key
    );
    let token = instance.launch_token();
    let record = ctx
        .bounded("create", ctx.cloud.create(spec, &token))
        .await
        .inspect_err(|e| error!("Failed to create EC2 instance for {}: {}", key, e))?;
    metrics::record_creation(key);

    info!(
        instance_id = %record.instance_id,
        state = %record.state,
        "EC2 instance created for {}",
        key
    );

    let mut status =
        Ec2InstanceStatus::launched(&record.instance_id, record.state, &record.addresses);
    status.recreations = instance.recreations();
    ctx.store
        .update_status(key, &status)
        .await
        .inspect_err(|e| {
            error!(
                "EC2 instance {} launched but recording it on {} failed: {}",
                status.instance_id, key, e
            )
        })?;

    Ok(Directive::RequeueAfter(ctx.timings.post_create_requeue))
}

/// Check the recorded instance against the provider and resync status
async fn verify_instance(
    key: &ObjectKey,
    instance: &Ec2Instance,
    ctx: &ControllerState,
) -> Result<Directive> {
    let instance_id = instance.instance_id();

    // A recorded id must always be protected by the finalizer
    if !has_finalizer(instance) {
        warn!(
            "Finalizer missing on {} while {} is recorded, re-attaching",
            key, instance_id
        );
        ctx.store.update_markers(key, finalizers::attach()).await?;
    }

    let described = ctx
        .bounded(
            "describe",
            ctx.cloud.describe(&instance.spec.region, instance_id),
        )
        .await?;

    let current = instance.status.clone().unwrap_or_default();

    let observed = match described {
        Some(observed) if !observed.state.is_terminated() => observed,
        gone => {
            warn!(
                reported = gone.as_ref().map(|d| d.state.as_str()).unwrap_or("not found"),
                "EC2 instance {} for {} is gone, resetting status for recreation",
                instance_id,
                key
            );
            metrics::record_drift(key);

            let mut status = current;
            status.reset_for_recreation();
            ctx.store.update_status(key, &status).await?;
            return Ok(Directive::requeue_now());
        }
    };

    let mut status = current.clone();
    status.state = observed.state;
    if !observed.addresses.is_empty() {
        status.set_addresses(&observed.addresses);
    }

    if status != current {
        info!(
            old = %current.state,
            new = %status.state,
            "Updating instance status for {}",
            key
        );
        ctx.store.update_status(key, &status).await?;
    } else {
        debug!("EC2 instance {} in sync", instance_id);
    }

    Ok(Directive::RequeueAfter(ctx.timings.steady_state_interval))
}
