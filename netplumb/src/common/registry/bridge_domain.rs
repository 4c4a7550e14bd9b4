// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use super::{RegistryError, Released, ResourceRegistry};
use crate::common::{
  connection::ConnectionId,
  context::RequestContext,
  driver::{DataplaneDriver, DriverError, ResourceHandle, ResourceSpec},
};

/// A VLAN id together with the interface its tagged traffic arrives on
pub type BridgeDomainKey = (u16, ResourceHandle);

/// One bridge domain per VLAN and uplink interface
///
/// A new bridge domain starts out with the uplink as its only member.
pub struct BridgeDomainRegistry {
  driver: Arc<dyn DataplaneDriver>,
  records: ResourceRegistry<BridgeDomainKey, ResourceHandle>,
}

impl BridgeDomainRegistry {
  pub fn new(driver: Arc<dyn DataplaneDriver>) -> Self {
    Self {
      driver,
      records: ResourceRegistry::new("bridge_domain"),
    }
  }

  pub async fn acquire(
    &self,
    ctx: &RequestContext,
    vlan: u16,
    uplink: ResourceHandle,
    consumer: &ConnectionId,
  ) -> Result<ResourceHandle, RegistryError<DriverError>> {
    let spec = ResourceSpec::BridgeDomain {
      vlan,
      members: vec![uplink],
    };
    self
      .records
      .acquire(&(vlan, uplink), consumer, || self.driver.create_resource(ctx, spec))
      .await
  }

  pub async fn release(
    &self,
    ctx: &RequestContext,
    vlan: u16,
    uplink: ResourceHandle,
    consumer: &ConnectionId,
  ) -> Result<Released, RegistryError<DriverError>> {
    self
      .records
      .release(&(vlan, uplink), consumer, |handle| {
        self.driver.delete_resource(ctx, handle)
      })
      .await
  }

  pub async fn handle(&self, vlan: u16, uplink: ResourceHandle) -> Option<ResourceHandle> {
    self.records.handle(&(vlan, uplink)).await
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::BridgeDomainRegistry;
  use crate::common::{
    connection::ConnectionId,
    context::RequestContext,
    driver::{memory::InMemoryDriver, ResourceKind},
  };

  #[tokio::test]
  async fn bridge_domain_starts_with_its_uplink() {
    let driver = InMemoryDriver::new();
    let uplink = driver.add_interface("eth1", "192.0.2.1/24".parse().unwrap(), 1500);
    let registry = BridgeDomainRegistry::new(Arc::new(driver.clone()));
    let ctx = RequestContext::background();
    let bd = registry
      .acquire(&ctx, 100, uplink, &ConnectionId::new("c1"))
      .await
      .unwrap();
    assert_eq!(driver.record(bd).unwrap().members, vec![uplink]);
    let other_vlan = registry
      .acquire(&ctx, 200, uplink, &ConnectionId::new("c1"))
      .await
      .unwrap();
    assert_ne!(bd, other_vlan);
    assert_eq!(driver.count(ResourceKind::BridgeDomain), 2);
  }
}
