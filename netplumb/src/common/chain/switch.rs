// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};

use super::{ArcElement, ChainElement, ChainResult, Next};
use crate::common::{
  connection::{Connection, MechanismKind},
  context::RequestContext,
};

/// Dispatches to a mechanism-specific branch, then continues with the rest of the chain
///
/// Connections whose mechanism has no branch, or which carry no mechanism yet, pass straight
/// through to the remainder of the chain.
#[derive(Default)]
pub struct MechanismSwitch {
  cases: Vec<(MechanismKind, Vec<ArcElement>)>,
}

impl MechanismSwitch {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn case(mut self, kind: MechanismKind, elements: Vec<ArcElement>) -> Self {
    self.cases.push((kind, elements));
    self
  }

  fn branch(&self, connection: &Connection) -> &[ArcElement] {
    let kind = match connection.mechanism_kind() {
      Some(kind) => kind,
      None => return &[],
    };
    self
      .cases
      .iter()
      .find(|(case, _)| case == kind)
      .map(|(_, elements)| elements.as_slice())
      .unwrap_or(&[])
  }
}

impl ChainElement for MechanismSwitch {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    let branch = self.branch(&connection);
    if branch.is_empty() {
      tracing::trace!(mechanism = ?connection.mechanism_kind(), "no mechanism branch; passing through");
      return next.request(ctx, connection);
    }
    async move { Next::then(branch, &next).request(ctx, connection).await }.boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<()>> {
    let branch = self.branch(&connection);
    if branch.is_empty() {
      return next.close(ctx, connection);
    }
    async move { Next::then(branch, &next).close(ctx, connection).await }.boxed()
  }
}
