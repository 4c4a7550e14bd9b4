// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use super::{close_sided, first_error, interface, request_sided, tolerate_missing, Sided};
use crate::common::{
  chain::{ChainElement, ChainError, ChainResult, Next},
  connection::{Connection, Role},
  context::RequestContext,
  driver::{Attribute, DataplaneDriver, ResourceHandle},
  metadata::keys,
  registry::bridge_domain::BridgeDomainRegistry,
};

/// Bridges VLAN-tagged connections onto the uplink carrying their VLAN
///
/// Untagged connections pass straight through.
pub struct BridgeDomainElement {
  role: Role,
  uplink: ResourceHandle,
  registry: Arc<BridgeDomainRegistry>,
  driver: Arc<dyn DataplaneDriver>,
}

impl BridgeDomainElement {
  pub fn new(
    role: Role,
    uplink: ResourceHandle,
    registry: Arc<BridgeDomainRegistry>,
    driver: Arc<dyn DataplaneDriver>,
  ) -> Self {
    Self {
      role,
      uplink,
      registry,
      driver,
    }
  }
}

impl Sided for BridgeDomainElement {
  fn name(&self) -> &'static str {
    "bridge_domain"
  }

  fn role(&self) -> Role {
    self.role
  }

  fn apply<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: &'a mut Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    async move {
      let vlan = connection.context.ethernet.vlan_tag;
      let member = match interface(ctx, self.role)? {
        Some(member) if vlan != 0 => member,
        _ => {
          tracing::trace!(vlan, "untagged or no interface; not bridging");
          return Ok(());
        }
      };
      let bridge = self
        .registry
        .acquire(ctx, vlan, self.uplink, &connection.id)
        .await?;
      // Recorded before joining, so a failed join still gives the share back
      ctx.metadata(self.role)?.store::<keys::BridgeDomain>(bridge);
      self
        .driver
        .set_attribute(ctx, bridge, Attribute::BridgeMember(member))
        .await
        .map_err(|e| ChainError::driver("add bridge domain member", e))?;
      tracing::debug!(%bridge, %member, vlan, "bridged interface");
      Ok(())
    }
    .boxed()
  }

  fn undo<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: &'a Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    async move {
      let bridge = match ctx.metadata(self.role)?.load_and_delete::<keys::BridgeDomain>() {
        Some(bridge) => bridge,
        None => return Ok(()),
      };
      let left = match interface(ctx, self.role)? {
        Some(member) => tolerate_missing(
          self
            .driver
            .set_attribute(ctx, bridge, Attribute::RemoveBridgeMember(member))
            .await,
        )
        .map_err(|e| ChainError::driver("remove bridge domain member", e)),
        None => Ok(()),
      };
      let released = self
        .registry
        .release(ctx, connection.context.ethernet.vlan_tag, self.uplink, &connection.id)
        .await
        .map(|_| ())
        .map_err(ChainError::from);
      first_error([left, released])
    }
    .boxed()
  }
}

impl ChainElement for BridgeDomainElement {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    request_sided(self, ctx, connection, next)
  }

  fn close<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<()>> {
    close_sided(self, ctx, connection, next)
  }
}
