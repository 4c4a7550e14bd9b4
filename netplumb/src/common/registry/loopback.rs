// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use super::{RegistryError, Released, ResourceRegistry};
use crate::common::{
  connection::ConnectionId,
  context::RequestContext,
  driver::{DataplaneDriver, DriverError, ResourceHandle, ResourceSpec},
};

/// One loopback interface per network service, shared by that service's connections
pub struct LoopbackRegistry {
  driver: Arc<dyn DataplaneDriver>,
  records: ResourceRegistry<String, ResourceHandle>,
}

impl LoopbackRegistry {
  pub fn new(driver: Arc<dyn DataplaneDriver>) -> Self {
    Self {
      driver,
      records: ResourceRegistry::new("loopback"),
    }
  }

  pub async fn acquire(
    &self,
    ctx: &RequestContext,
    network_service: &str,
    consumer: &ConnectionId,
  ) -> Result<ResourceHandle, RegistryError<DriverError>> {
    let spec = ResourceSpec::Loopback {
      tag: network_service.to_string(),
    };
    self
      .records
      .acquire(&network_service.to_string(), consumer, || {
        self.driver.create_resource(ctx, spec)
      })
      .await
  }

  pub async fn release(
    &self,
    ctx: &RequestContext,
    network_service: &str,
    consumer: &ConnectionId,
  ) -> Result<Released, RegistryError<DriverError>> {
    self
      .records
      .release(&network_service.to_string(), consumer, |handle| {
        self.driver.delete_resource(ctx, handle)
      })
      .await
  }

  pub async fn handle(&self, network_service: &str) -> Option<ResourceHandle> {
    self.records.handle(&network_service.to_string()).await
  }

  pub async fn consumers(&self, network_service: &str) -> usize {
    self.records.consumers(&network_service.to_string()).await
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}
