//! AWS EC2 provider
//!
//! One SDK client per region, created lazily from the shared AWS
//! configuration (environment, profile, IRSA or instance metadata).

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_ec2::config::Region;
use aws_sdk_ec2::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_ec2::types::{Instance, InstanceType, ResourceType, Tag, TagSpecification};
use aws_sdk_ec2::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CloudProvider, InstanceDescription, InstanceRecord};
use crate::crd::{Ec2InstanceSpec, InstanceAddresses, InstanceState};
use crate::error::{Error, Result};

/// Error code EC2 returns for ids it does not know (or no longer knows)
const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

pub struct Ec2Provider {
    shared: SdkConfig,
    clients: Mutex<HashMap<String, Client>>,
}

impl Ec2Provider {
    /// Load AWS configuration from the standard provider chain
    pub async fn from_env() -> Self {
        let shared = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Self::new(shared)
    }

    pub fn new(shared: SdkConfig) -> Self {
        Self {
            shared,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, region: &str) -> Client {
        let mut clients = self.clients.lock().await;
        clients
            .entry(region.to_string())
            .or_insert_with(|| {
                debug!("Creating EC2 client for region {}", region);
                let config = aws_sdk_ec2::config::Builder::from(&self.shared)
                    .region(Region::new(region.to_string()))
                    .build();
                Client::from_conf(config)
            })
            .clone()
    }
}

fn addresses_of(instance: &Instance) -> InstanceAddresses {
    InstanceAddresses {
        public_ip: instance.public_ip_address().unwrap_or_default().to_string(),
        private_ip: instance.private_ip_address().unwrap_or_default().to_string(),
        public_dns: instance.public_dns_name().unwrap_or_default().to_string(),
        private_dns: instance.private_dns_name().unwrap_or_default().to_string(),
    }
}

fn state_of(instance: &Instance) -> InstanceState {
    instance
        .state()
        .and_then(|s| s.name())
        .map(|name| InstanceState::from(name.as_str()))
        .unwrap_or_default()
}

fn tag_specification(spec: &Ec2InstanceSpec) -> TagSpecification {
    let tags = spec
        .tags
        .iter()
        .map(|(key, value)| Tag::builder().key(key).value(value).build())
        .collect();

    TagSpecification::builder()
        .resource_type(ResourceType::Instance)
        .set_tags(Some(tags))
        .build()
}

#[async_trait]
impl CloudProvider for Ec2Provider {
    async fn create(&self, spec: &Ec2InstanceSpec, client_token: &str) -> Result<InstanceRecord> {
        let client = self.client(&spec.region).await;

        let mut request = client
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(InstanceType::from(spec.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .client_token(client_token);

        if !spec.key_pair.is_empty() {
            request = request.key_name(&spec.key_pair);
        }
        if !spec.subnet.is_empty() {
            request = request.subnet_id(&spec.subnet);
        }
        if !spec.tags.is_empty() {
            request = request.tag_specifications(tag_specification(spec));
        }

        let output = request
            .send()
            .await
            .map_err(|e| Error::cloud("create", DisplayErrorContext(&e).to_string()))?;

        let instance = output
            .instances()
            .first()
            .ok_or_else(|| Error::cloud("create", "RunInstances returned no instance"))?;
        let instance_id = instance
            .instance_id()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::cloud("create", "RunInstances returned no instance id"))?;

        info!("EC2 launched {} in {}", instance_id, spec.region);

        Ok(InstanceRecord {
            instance_id: instance_id.to_string(),
            state: state_of(instance),
            addresses: addresses_of(instance),
        })
    }

    async fn describe(
        &self,
        region: &str,
        instance_id: &str,
    ) -> Result<Option<InstanceDescription>> {
        let client = self.client(region).await;

        let output = match client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some(INSTANCE_NOT_FOUND) => {
                return Ok(None);
            }
            Err(e) => return Err(Error::cloud("describe", DisplayErrorContext(&e).to_string())),
        };

        let found = output
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find(|i| i.instance_id() == Some(instance_id));

        Ok(found.map(|instance| InstanceDescription {
            state: state_of(instance),
            addresses: addresses_of(instance),
        }))
    }

    async fn terminate(&self, region: &str, instance_id: &str) -> Result<()> {
        let client = self.client(region).await;

        match client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().and_then(|se| se.code()) == Some(INSTANCE_NOT_FOUND) => {
                debug!("{} already gone from EC2", instance_id);
                Ok(())
            }
            Err(e) => Err(Error::cloud("terminate", DisplayErrorContext(&e).to_string())),
        }
    }
}
