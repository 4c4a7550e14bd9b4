// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{collections::BTreeSet, sync::Arc};

use futures::future::{BoxFuture, FutureExt};

use super::{close_sided, first_error, interface, request_sided, Sided};
use crate::common::{
  chain::{ChainElement, ChainError, ChainResult, Next},
  connection::{AddressFamily, Connection, Role},
  context::RequestContext,
  driver::{Attribute, DataplaneDriver},
  metadata::MetadataKey,
  registry::vrf::VrfRegistry,
};

/// Families whose routing table this connection holds a share of
struct Families;

impl MetadataKey for Families {
  type Value = Vec<AddressFamily>;
}

/// Places the connection's interface into the network service's routing tables
///
/// One table is shared per address family in use by the connection's addresses and routes.
pub struct VrfElement {
  role: Role,
  registry: Arc<VrfRegistry>,
  driver: Arc<dyn DataplaneDriver>,
}

impl VrfElement {
  pub fn new(role: Role, registry: Arc<VrfRegistry>, driver: Arc<dyn DataplaneDriver>) -> Self {
    Self {
      role,
      registry,
      driver,
    }
  }

  async fn bind(&self, ctx: &RequestContext, connection: &Connection) -> ChainResult<()> {
    let families: BTreeSet<AddressFamily> = connection
      .context
      .ip
      .all_addresses()
      .map(|prefix| prefix.family())
      .collect();
    if families.is_empty() {
      tracing::trace!("no addresses; no routing table needed");
      return Ok(());
    }
    let metadata = ctx.metadata(self.role)?;
    let interface = interface(ctx, self.role)?;
    let mut held = metadata.load::<Families>().unwrap_or_default();
    for family in families {
      let table = self
        .registry
        .acquire(ctx, &connection.network_service, family, &connection.id)
        .await?;
      if !held.contains(&family) {
        held.push(family);
        metadata.store::<Families>(held.clone());
      }
      if let Some(interface) = interface {
        self
          .driver
          .set_attribute(ctx, interface, Attribute::RoutingTable(table))
          .await
          .map_err(|e| ChainError::driver("bind interface to routing table", e))?;
        tracing::debug!(%interface, %table, %family, "bound interface to routing table");
      }
    }
    Ok(())
  }
}

impl Sided for VrfElement {
  fn name(&self) -> &'static str {
    "vrf"
  }

  fn role(&self) -> Role {
    self.role
  }

  fn apply<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: &'a mut Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    self.bind(ctx, connection).boxed()
  }

  fn undo<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: &'a Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    async move {
      let held = ctx
        .metadata(self.role)?
        .load_and_delete::<Families>()
        .unwrap_or_default();
      let mut released = Vec::with_capacity(held.len());
      // The interface leaves its tables along with it, so only the shares need giving back
      for family in held {
        released.push(
          self
            .registry
            .release(ctx, &connection.network_service, family, &connection.id)
            .await
            .map(|_| ())
            .map_err(ChainError::from),
        );
      }
      first_error(released)
    }
    .boxed()
  }
}

impl ChainElement for VrfElement {
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
