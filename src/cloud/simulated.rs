//! In-memory cloud provider
//!
//! Behaves like a small EC2: ids look like `i-00000000000000001`, fresh
//! instances start `pending` with only private addressing, terminated
//! instances stay describable. Faults and out-of-band changes can be
//! injected to exercise the reconciler's recovery paths.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CloudProvider, InstanceDescription, InstanceRecord};
use crate::crd::{Ec2InstanceSpec, InstanceAddresses, InstanceState};
use crate::error::{Error, Result};

#[derive(Clone, Debug)]
struct SimInstance {
    region: String,
    state: InstanceState,
    addresses: InstanceAddresses,
    ordinal: u64,
}

#[derive(Default)]
struct SimState {
    instances: HashMap<String, SimInstance>,
    client_tokens: HashMap<String, String>,
    next_ordinal: u64,
    create_calls: u32,
    describe_calls: u32,
    terminate_calls: u32,
    failing_creates: u32,
    failing_describes: u32,
    failing_terminates: u32,
}

/// Simulated provider with fault injection
#[derive(Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
    auto_boot: bool,
    latency: Duration,
}

fn private_addresses(ordinal: u64, region: &str) -> InstanceAddresses {
    let (hi, lo) = ((ordinal / 250) % 250, ordinal % 250 + 1);
    InstanceAddresses {
        private_ip: format!("10.0.{}.{}", hi, lo),
        private_dns: format!("ip-10-0-{}-{}.{}.compute.internal", hi, lo, region),
        ..Default::default()
    }
}

fn assign_public_address(instance: &mut SimInstance) {
    let host = instance.ordinal % 254 + 1;
    instance.addresses.public_ip = format!("203.0.113.{}", host);
    instance.addresses.public_dns = format!(
        "ec2-203-0-113-{}.{}.compute.amazonaws.com",
        host, instance.region
    );
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance instances on every describe: pending becomes running (with a
    /// public address) and shutting-down becomes terminated
    pub fn with_auto_boot(mut self) -> Self {
        self.auto_boot = true;
        self
    }

    /// Delay every call, to exercise call timeouts
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    /// Change an instance's state out-of-band
    pub async fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self.state.lock().await.instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Make an instance vanish as if deleted by someone else
    pub async fn remove(&self, instance_id: &str) {
        self.state.lock().await.instances.remove(instance_id);
    }

    pub async fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.state
            .lock()
            .await
            .instances
            .get(instance_id)
            .map(|i| i.state.clone())
    }

    /// Instances that have not reached `terminated`
    pub async fn live_instances(&self) -> usize {
        self.state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| !i.state.is_terminated())
            .count()
    }

    pub async fn create_calls(&self) -> u32 {
        self.state.lock().await.create_calls
    }

    pub async fn describe_calls(&self) -> u32 {
        self.state.lock().await.describe_calls
    }

    pub async fn terminate_calls(&self) -> u32 {
        self.state.lock().await.terminate_calls
    }

    pub async fn fail_next_creates(&self, n: u32) {
        self.state.lock().await.failing_creates = n;
    }

    pub async fn fail_next_describes(&self, n: u32) {
        self.state.lock().await.failing_describes = n;
    }

    pub async fn fail_next_terminates(&self, n: u32) {
        self.state.lock().await.failing_terminates = n;
    }
}

#[async_trait]
impl CloudProvider for SimulatedCloud {
    async fn create(&self, spec: &Ec2InstanceSpec, client_token: &str) -> Result<InstanceRecord> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(Error::cloud("create", "InsufficientInstanceCapacity"));
        }

        if let Some(existing) = state
            .client_tokens
            .get(client_token)
            .and_then(|id| state.instances.get(id).map(|i| (id, i)))
        {
            debug!("Client token {} already launched {}", client_token, existing.0);
            return Ok(InstanceRecord {
                instance_id: existing.0.clone(),
                state: existing.1.state.clone(),
                addresses: existing.1.addresses.clone(),
            });
        }

        state.next_ordinal += 1;
        let ordinal = state.next_ordinal;
        let instance_id = format!("i-{:017x}", ordinal);
        let instance = SimInstance {
            region: spec.region.clone(),
            state: InstanceState::Pending,
            addresses: private_addresses(ordinal, &spec.region),
            ordinal,
        };
        debug!("Simulated launch of {} ({})", instance_id, spec.instance_type);

        let record = InstanceRecord {
            instance_id: instance_id.clone(),
            state: instance.state.clone(),
            addresses: instance.addresses.clone(),
        };
        state
            .client_tokens
            .insert(client_token.to_string(), instance_id.clone());
        state.instances.insert(instance_id, instance);
        Ok(record)
    }

    async fn describe(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.describe_calls += 1;
        if state.failing_describes > 0 {
            state.failing_describes -= 1;
            return Err(Error::cloud("describe", "RequestLimitExceeded"));
        }

        let auto_boot = self.auto_boot;
        let Some(instance) = state
            .instances
            .get_mut(instance_id)
            .filter(|i| i.region == region)
        else {
            return Ok(None);
        };

        if auto_boot {
            match instance.state {
                InstanceState::Pending => {
                    instance.state = InstanceState::Running;
                    assign_public_address(instance);
                }
                InstanceState::ShuttingDown => instance.state = InstanceState::Terminated,
                _ => {}
            }
        }

        Ok(Some(InstanceDescription {
            state: instance.state.clone(),
            addresses: instance.addresses.clone(),
        }))
    }

    async fn terminate(&self, _region: &str, instance_id: &str) -> Result<()> {
        self.pause().await;
        let mut state = self.state.lock().await;
        state.terminate_calls += 1;
        if state.failing_terminates > 0 {
            state.failing_terminates -= 1;
            return Err(Error::cloud("terminate", "RequestLimitExceeded"));
        }

        let auto_boot = self.auto_boot;
        if let Some(instance) = state.instances.get_mut(instance_id) {
            if !instance.state.is_terminated() {
                instance.state = if auto_boot {
                    InstanceState::ShuttingDown
                } else {
                    InstanceState::Terminated
                };
            }
        }
        Ok(())
    }
}
