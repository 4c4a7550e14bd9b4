// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing_futures::Instrument;

use super::element_span;
use crate::common::{
  chain::{ChainElement, ChainResult, Next},
  connection::{Connection, Role},
  context::RequestContext,
  driver::ResourceHandle,
  metadata::MetadataKey,
  registry::loopback::LoopbackRegistry,
};

/// The loopback this connection holds a share of
struct Loopback;

impl MetadataKey for Loopback {
  type Value = ResourceHandle;
}

/// Holds a share of the network service's loopback interface for the connection's lifetime
pub struct LoopbackElement {
  role: Role,
  registry: Arc<LoopbackRegistry>,
}

impl LoopbackElement {
  pub fn new(role: Role, registry: Arc<LoopbackRegistry>) -> Self {
    Self { role, registry }
  }
}

impl ChainElement for LoopbackElement {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    let span = element_span("loopback", self.role, "request");
    async move {
      let metadata = ctx.metadata(self.role)?;
      let id = connection.id.clone();
      let service = connection.network_service.clone();
      let refresh = metadata.load::<Loopback>().is_some();
      let handle = self.registry.acquire(ctx, &service, &id).await?;
      metadata.store::<Loopback>(handle);

      let postponed = ctx.postpone();
      match next.request(ctx, connection).await {
        Ok(connection) => Ok(connection),
        // An established connection keeps its share through a failed refresh
        Err(e) if refresh => Err(e),
        Err(e) => {
          let rollback_ctx = postponed.context();
          metadata.delete::<Loopback>();
          let released: ChainResult<()> = self
            .registry
            .release(&rollback_ctx, &service, &id)
            .await
            .map(|_| ())
            .map_err(Into::into);
          if let Err(rollback) = &released {
            tracing::error!(error = %rollback, "rollback failed");
          }
          Err(e.with_rollback(released))
        }
      }
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
    let span = element_span("loopback", self.role, "close");
    async move {
      let released: ChainResult<()> = match ctx.metadata(self.role) {
        Ok(metadata) => {
          metadata.delete::<Loopback>();
          self
            .registry
            .release(ctx, &connection.network_service, &connection.id)
            .await
            .map(|_| ())
            .map_err(Into::into)
        }
        Err(e) => Err(e.into()),
      };
      if let Err(e) = &released {
        tracing::warn!(error = %e, "teardown failed; continuing close");
      }
      let closed = next.close(ctx, connection).await;
      released.and(closed)
    }
    .instrument(span)
    .boxed()
  }
}
