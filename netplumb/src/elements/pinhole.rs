// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::IpAddr, sync::Arc};

use futures::future::{self, BoxFuture, FutureExt};

use super::{close_sided, request_sided, Sided};
use crate::common::{
  chain::{ChainElement, ChainError, ChainResult, Next},
  connection::{params, Connection, Role},
  context::RequestContext,
  driver::TunnelKind,
  registry::pinhole::PinholeSet,
};

/// Opens ACL pinholes for the local end of UDP-based tunnels
///
/// Pinholes outlive the connections which opened them, so closing leaves them in place.
pub struct PinholeElement {
  role: Role,
  pinholes: Arc<PinholeSet>,
}

impl PinholeElement {
  pub fn new(role: Role, pinholes: Arc<PinholeSet>) -> Self {
    Self { role, pinholes }
  }

  /// The local (address, port) tunnel traffic arrives on, if the connection is a UDP tunnel
  fn local_end(&self, connection: &Connection) -> ChainResult<Option<(IpAddr, u16)>> {
    let mechanism = match connection.mechanism.as_ref() {
      Some(mechanism) => mechanism,
      None => return Ok(None),
    };
    let kind = match TunnelKind::from_mechanism(&mechanism.kind) {
      Some(kind) => kind,
      None => return Ok(None),
    };
    let default_port = match kind.default_port() {
      Some(port) => port,
      None => return Ok(None),
    };
    let (ip, port) = match self.role {
      Role::Client => (params::SRC_IP, params::SRC_PORT),
      Role::Server => (params::DST_IP, params::DST_PORT),
    };
    let addr = mechanism.require_parameter(ip)?;
    let port = mechanism.parse_parameter(port)?.unwrap_or(default_port);
    Ok(Some((addr, port)))
  }
}

impl Sided for PinholeElement {
  fn name(&self) -> &'static str {
    "pinhole"
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
      let (addr, port) = match self.local_end(connection)? {
        Some(end) => end,
        None => {
          tracing::trace!("not a UDP tunnel; no pinhole needed");
          return Ok(());
        }
      };
      self
        .pinholes
        .ensure(ctx, addr, port)
        .await
        .map_err(|e| ChainError::driver("open pinhole", e))?;
      Ok(())
    }
    .boxed()
  }

  fn undo<'a>(
    &'a self,
    _ctx: &'a RequestContext,
    _connection: &'a Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    future::ready(Ok(())).boxed()
  }
}

impl ChainElement for PinholeElement {
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
