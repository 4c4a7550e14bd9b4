// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Chain elements programming per-connection dataplane state
//!
//! Elements which need the connection's interface come in two flavours of ordering. On the client,
//! the interface only exists once the downstream has answered, so they act after delegating and
//! unwind the downstream when they fail. On the server, the interface is created on the way in, so
//! they act before delegating and unwind themselves when the downstream fails. [Sided] captures
//! that pattern for elements which fit it.
//!
//! Within one chain, elements whose state depends on the interface tear it down *before* the
//! element owning the interface deletes it; the tunnel element therefore deletes after delegating
//! its close.

use futures::future::{BoxFuture, FutureExt};
use tracing_futures::Instrument;

use crate::common::{
  chain::{rollback_downstream, ChainResult, Next},
  connection::{Connection, Role},
  context::RequestContext,
  driver::{DriverError, ResourceHandle},
  metadata::keys,
};

pub mod bridge_domain;
pub mod ip_address;
pub mod loopback;
pub mod metadata;
pub mod mtu;
pub mod pinhole;
pub mod tunnel;
pub mod up;
pub mod vrf;

pub use bridge_domain::BridgeDomainElement;
pub use ip_address::IpAddressElement;
pub use loopback::LoopbackElement;
pub use metadata::MetadataElement;
pub use mtu::MtuElement;
pub use pinhole::PinholeElement;
pub use tunnel::TunnelElement;
pub use up::UpElement;
pub use vrf::VrfElement;

/// Programming which one role applies on its own side of the downstream call
pub(crate) trait Sided: Send + Sync {
  fn name(&self) -> &'static str;

  fn role(&self) -> Role;

  fn apply<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: &'a mut Connection,
  ) -> BoxFuture<'a, ChainResult<()>>;

  /// Reverts `apply`; must succeed when there is nothing to revert
  fn undo<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: &'a Connection,
  ) -> BoxFuture<'a, ChainResult<()>>;
}

pub(crate) fn element_span(name: &'static str, role: Role, op: &'static str) -> tracing::Span {
  tracing::debug_span!("element", name, %role, op)
}

async fn undo_for_rollback<S: Sided + ?Sized>(
  side: &S,
  ctx: &RequestContext,
  connection: &Connection,
) -> ChainResult<()> {
  let undone = side.undo(ctx, connection).await;
  if let Err(e) = &undone {
    tracing::error!(error = %e, "rollback failed");
  }
  undone
}

pub(crate) fn request_sided<'a, S: Sided + ?Sized>(
  side: &'a S,
  ctx: &'a RequestContext,
  connection: Connection,
  next: Next<'a>,
) -> BoxFuture<'a, ChainResult<Connection>> {
  let span = element_span(side.name(), side.role(), "request");
  async move {
    let postponed = ctx.postpone();
    match side.role() {
      Role::Client => {
        let mut connection = next.request(ctx, connection).await?;
        if let Err(e) = side.apply(ctx, &mut connection).await {
          let rollback_ctx = postponed.context();
          let e = e.with_rollback(undo_for_rollback(side, &rollback_ctx, &connection).await);
          return Err(rollback_downstream(&rollback_ctx, next, connection, e).await);
        }
        Ok(connection)
      }
      Role::Server => {
        let mut connection = connection;
        if let Err(e) = side.apply(ctx, &mut connection).await {
          let rollback_ctx = postponed.context();
          return Err(e.with_rollback(undo_for_rollback(side, &rollback_ctx, &connection).await));
        }
        let applied = connection.clone();
        match next.request(ctx, connection).await {
          Ok(connection) => Ok(connection),
          Err(e) => {
            let rollback_ctx = postponed.context();
            Err(e.with_rollback(undo_for_rollback(side, &rollback_ctx, &applied).await))
          }
        }
      }
    }
  }
  .instrument(span)
  .boxed()
}

pub(crate) fn close_sided<'a, S: Sided + ?Sized>(
  side: &'a S,
  ctx: &'a RequestContext,
  connection: Connection,
  next: Next<'a>,
) -> BoxFuture<'a, ChainResult<()>> {
  let span = element_span(side.name(), side.role(), "close");
  async move {
    let undone = side.undo(ctx, &connection).await;
    if let Err(e) = &undone {
      tracing::warn!(error = %e, "teardown failed; continuing close");
    }
    let closed = next.close(ctx, connection).await;
    undone.and(closed)
  }
  .instrument(span)
  .boxed()
}

/// The interface recorded for this connection on `role`'s side, if it has one yet
pub(crate) fn interface(ctx: &RequestContext, role: Role) -> ChainResult<Option<ResourceHandle>> {
  Ok(ctx.metadata(role)?.load::<keys::Interface>())
}

/// Treats a resource which no longer exists as already torn down
pub(crate) fn tolerate_missing(result: Result<(), DriverError>) -> Result<(), DriverError> {
  match result {
    Err(DriverError::NotFound(handle)) => {
      tracing::trace!(%handle, "resource already gone");
      Ok(())
    }
    other => other,
  }
}

/// Keeps the first error of a teardown while letting later steps run
pub(crate) fn first_error(results: impl IntoIterator<Item = ChainResult<()>>) -> ChainResult<()> {
  let mut first = None;
  for result in results {
    if let Err(e) = result {
      if first.is_none() {
        first = Some(e);
      } else {
        tracing::warn!(error = %e, "additional teardown failure");
      }
    }
  }
  match first {
    Some(e) => Err(e),
    None => Ok(()),
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use std::{net::IpAddr, sync::Arc};

  use futures::future::{BoxFuture, FutureExt};

  use super::metadata::MetadataElement;
  use crate::common::{
    chain::{ArcElement, Chain, ChainElement, ChainResult, Next},
    connection::{params, Connection, Mechanism, MechanismKind, Role},
    context::RequestContext,
    driver::{memory::InMemoryDriver, DataplaneDriver, ResourceHandle, ResourceSpec},
    metadata::{keys, MetadataStore},
  };

  /// A chain fronted by a metadata element, as every chain using interface-dependent elements is
  pub(crate) fn chain_of(role: Role, store: &Arc<MetadataStore>, elements: Vec<ArcElement>) -> Chain {
    let mut builder = Chain::builder(role).with(MetadataElement::new(role, Arc::clone(store)));
    for element in elements {
      builder = builder.with_arc(element);
    }
    builder.build()
  }

  pub(crate) fn vxlan_connection(id: &str, client: IpAddr, server: IpAddr) -> Connection {
    Connection::new(id, "svc").with_mechanism(
      Mechanism::new(MechanismKind::Vxlan)
        .with_parameter(params::SRC_IP, client)
        .with_parameter(params::DST_IP, server)
        .with_parameter(params::VNI, 42),
    )
  }

  /// Creates a bare interface standing in for one made by a tunnel element
  pub(crate) async fn stand_in_interface(driver: &InMemoryDriver) -> ResourceHandle {
    driver
      .create_resource(
        &RequestContext::background(),
        ResourceSpec::Loopback {
          tag: "stand-in".into(),
        },
      )
      .await
      .unwrap()
  }

  /// Records `handle` as the connection's interface, then delegates
  pub(crate) struct WithInterface {
    pub role: Role,
    pub handle: ResourceHandle,
  }

  impl ChainElement for WithInterface {
    fn request<'a>(
      &'a self,
      ctx: &'a RequestContext,
      connection: Connection,
      next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Connection>> {
      async move {
        ctx.metadata(self.role)?.store::<keys::Interface>(self.handle);
        next.request(ctx, connection).await
      }
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
}
