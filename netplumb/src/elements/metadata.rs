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
  metadata::MetadataStore,
};

/// Lifecycle boundary of a connection's metadata partition
///
/// Scopes the partition into the context for the rest of the chain, and drops it once the
/// connection has closed. A request which fails on a partition it created also drops it, since no
/// close will follow to find it; a failed refresh of an established connection keeps it.
pub struct MetadataElement {
  role: Role,
  store: Arc<MetadataStore>,
}

impl MetadataElement {
  pub fn new(role: Role, store: Arc<MetadataStore>) -> Self {
    Self { role, store }
  }

  pub fn store(&self) -> &Arc<MetadataStore> {
    &self.store
  }
}

impl ChainElement for MetadataElement {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    let span = element_span("metadata", self.role, "request");
    async move {
      let id = connection.id.clone();
      let (partition, created) = self.store.scope(&id, self.role);
      let scoped = ctx.clone().with_metadata(self.role, partition);
      let result = next.request(&scoped, connection).await;
      if result.is_err() && created {
        tracing::trace!(connection = %id, "dropping metadata of failed request");
        self.store.release(&id, self.role);
      }
      result
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
    let span = element_span("metadata", self.role, "close");
    async move {
      let id = connection.id.clone();
      let (partition, _) = self.store.scope(&id, self.role);
      let scoped = ctx.clone().with_metadata(self.role, partition);
      let result = next.close(&scoped, connection).await;
      self.store.release(&id, self.role);
      result
    }
    .instrument(span)
    .boxed()
  }
}
