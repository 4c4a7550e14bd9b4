// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing_futures::Instrument;

use super::{element_span, interface};
use crate::common::{
  chain::{rollback_downstream, ChainElement, ChainError, ChainResult, Next},
  connection::{Connection, Role},
  context::RequestContext,
  driver::{Attribute, DataplaneDriver},
  mtu::{negotiate, TunnelMtu},
};

/// Negotiates the connection MTU down to what fits through the tunnel
///
/// Each side clamps the proposal it sees to its own ceiling, so the value returned to the client
/// is the least of every party's. The client then programs it onto its interface.
pub struct MtuElement {
  role: Role,
  ceiling: Arc<TunnelMtu>,
  driver: Arc<dyn DataplaneDriver>,
}

impl MtuElement {
  pub fn new(role: Role, ceiling: Arc<TunnelMtu>, driver: Arc<dyn DataplaneDriver>) -> Self {
    Self {
      role,
      ceiling,
      driver,
    }
  }

  fn applies_to(&self, connection: &Connection) -> bool {
    connection.mechanism_kind() == Some(&self.ceiling.kind().mechanism())
  }

  async fn clamp(&self, ctx: &RequestContext, connection: &mut Connection) -> ChainResult<u32> {
    let ceiling = self.ceiling.get_or_compute(ctx).await?;
    let proposed = connection.context.mtu;
    connection.context.mtu = negotiate(proposed, ceiling);
    tracing::trace!(proposed, ceiling, mtu = connection.context.mtu, "clamped MTU proposal");
    Ok(ceiling)
  }

  async fn program(&self, ctx: &RequestContext, mtu: u32) -> ChainResult<()> {
    let handle = match interface(ctx, self.role)? {
      Some(handle) => handle,
      None => return Ok(()),
    };
    self
      .driver
      .set_attribute(ctx, handle, Attribute::Mtu(mtu))
      .await
      .map_err(|e| ChainError::driver("set interface MTU", e))?;
    tracing::debug!(%handle, mtu, "programmed negotiated MTU");
    Ok(())
  }
}

impl ChainElement for MtuElement {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    mut connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    if !self.applies_to(&connection) {
      return next.request(ctx, connection);
    }
    let span = element_span("mtu", self.role, "request");
    async move {
      let ceiling = self.clamp(ctx, &mut connection).await?;
      if !self.role.is_client() {
        return next.request(ctx, connection).await;
      }
      let postponed = ctx.postpone();
      let mut connection = next.request(ctx, connection).await?;
      connection.context.mtu = negotiate(connection.context.mtu, ceiling);
      if let Err(e) = self.program(ctx, connection.context.mtu).await {
        let rollback_ctx = postponed.context();
        return Err(rollback_downstream(&rollback_ctx, next, connection, e).await);
      }
      Ok(connection)
    }
    .instrument(span)
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<()>> {
    next.close(ctx, connection)
  }
}
