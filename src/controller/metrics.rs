//! Prometheus metrics for the ec2-operator

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::store::ObjectKey;

/// Labels identifying one Ec2Instance
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InstanceLabels {
    pub namespace: String,
    pub name: String,
}

impl From<&ObjectKey> for InstanceLabels {
    fn from(key: &ObjectKey) -> Self {
        Self {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }
}

/// Labels for reconcile outcomes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

/// Reconciliations by outcome (done, requeue, or an error label)
pub static RECONCILIATIONS: Lazy<Family<OutcomeLabels, Counter>> = Lazy::new(Family::default);

/// EC2 instances launched per Ec2Instance
pub static INSTANCES_CREATED: Lazy<Family<InstanceLabels, Counter>> = Lazy::new(Family::default);

/// Out-of-band disappearances detected per Ec2Instance
pub static DRIFT_DETECTED: Lazy<Family<InstanceLabels, Counter>> = Lazy::new(Family::default);

/// EC2 instances terminated on deletion per Ec2Instance
pub static INSTANCES_TERMINATED: Lazy<Family<InstanceLabels, Counter>> =
    Lazy::new(Family::default);

/// Keys waiting in the work queue
pub static QUEUE_DEPTH: Lazy<Gauge> = Lazy::new(Gauge::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "ec2_operator_reconciliations",
        "Reconciliations by outcome",
        RECONCILIATIONS.clone(),
    );
    registry.register(
        "ec2_operator_instances_created",
        "EC2 instances launched",
        INSTANCES_CREATED.clone(),
    );
    registry.register(
        "ec2_operator_drift_detected",
        "EC2 instances found missing or terminated out-of-band",
        DRIFT_DETECTED.clone(),
    );
    registry.register(
        "ec2_operator_instances_terminated",
        "EC2 instances terminated on Ec2Instance deletion",
        INSTANCES_TERMINATED.clone(),
    );
    registry.register(
        "ec2_operator_queue_depth",
        "Keys waiting in the reconcile queue",
        QUEUE_DEPTH.clone(),
    );
    registry
});

pub fn record_reconcile(outcome: &str) {
    RECONCILIATIONS
        .get_or_create(&OutcomeLabels {
            outcome: outcome.to_string(),
        })
        .inc();
}

pub fn record_creation(key: &ObjectKey) {
    INSTANCES_CREATED.get_or_create(&key.into()).inc();
}

pub fn record_drift(key: &ObjectKey) {
    DRIFT_DETECTED.get_or_create(&key.into()).inc();
}

pub fn record_termination(key: &ObjectKey) {
    INSTANCES_TERMINATED.get_or_create(&key.into()).inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}
