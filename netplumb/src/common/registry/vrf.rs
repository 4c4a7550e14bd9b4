// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use super::{RegistryError, Released, ResourceRegistry};
use crate::common::{
  connection::{AddressFamily, ConnectionId},
  context::RequestContext,
  driver::{DataplaneDriver, DriverError, ResourceHandle, ResourceSpec},
};

type VrfKey = (String, AddressFamily);

/// One routing table per network service and address family
pub struct VrfRegistry {
  driver: Arc<dyn DataplaneDriver>,
  records: ResourceRegistry<VrfKey, ResourceHandle>,
}

impl VrfRegistry {
  pub fn new(driver: Arc<dyn DataplaneDriver>) -> Self {
    Self {
      driver,
      records: ResourceRegistry::new("vrf"),
    }
  }

  pub async fn acquire(
    &self,
    ctx: &RequestContext,
    network_service: &str,
    family: AddressFamily,
    consumer: &ConnectionId,
  ) -> Result<ResourceHandle, RegistryError<DriverError>> {
    let spec = ResourceSpec::RoutingTable {
      family,
      tag: network_service.to_string(),
    };
    self
      .records
      .acquire(&(network_service.to_string(), family), consumer, || {
        self.driver.create_resource(ctx, spec)
      })
      .await
  }

  pub async fn release(
    &self,
    ctx: &RequestContext,
    network_service: &str,
    family: AddressFamily,
    consumer: &ConnectionId,
  ) -> Result<Released, RegistryError<DriverError>> {
    self
      .records
      .release(&(network_service.to_string(), family), consumer, |handle| {
        self.driver.delete_resource(ctx, handle)
      })
      .await
  }

  pub async fn handle(&self, network_service: &str, family: AddressFamily) -> Option<ResourceHandle> {
    self
      .records
      .handle(&(network_service.to_string(), family))
      .await
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}
