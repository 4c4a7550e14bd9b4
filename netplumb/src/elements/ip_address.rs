// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};

use super::{close_sided, interface, request_sided, Sided};
use crate::common::{
  chain::{ChainElement, ChainError, ChainResult, Next},
  connection::{Connection, Role},
  context::RequestContext,
  driver::{Attribute, DataplaneDriver},
};

/// Assigns the role's own addresses to the connection's interface
///
/// Addresses go away with the interface, so there is nothing to undo.
pub struct IpAddressElement {
  role: Role,
  driver: Arc<dyn DataplaneDriver>,
}

impl IpAddressElement {
  pub fn new(role: Role, driver: Arc<dyn DataplaneDriver>) -> Self {
    Self { role, driver }
  }
}

impl Sided for IpAddressElement {
  fn name(&self) -> &'static str {
    "ip_address"
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
      let handle = match interface(ctx, self.role)? {
        Some(handle) => handle,
        None => return Ok(()),
      };
      for prefix in connection.context.ip.addresses_for(self.role) {
        self
          .driver
          .set_attribute(ctx, handle, Attribute::IpAddress(*prefix))
          .await
          .map_err(|e| ChainError::driver("assign interface address", e))?;
        tracing::debug!(%handle, %prefix, "assigned address");
      }
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

impl ChainElement for IpAddressElement {
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

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::IpAddressElement;
  use crate::{
    common::{
      connection::{Connection, IpPrefix, Role},
      context::RequestContext,
      driver::memory::InMemoryDriver,
      metadata::MetadataStore,
    },
    elements::tests::{chain_of, stand_in_interface, WithInterface},
  };

  #[tokio::test]
  async fn each_side_assigns_its_own_addresses() {
    let client_driver = InMemoryDriver::new();
    let server_driver = InMemoryDriver::new();
    let client_if = stand_in_interface(&client_driver).await;
    let server_if = stand_in_interface(&server_driver).await;
    let store = Arc::new(MetadataStore::new());
    let server = chain_of(
      Role::Server,
      &store,
      vec![
        Arc::new(WithInterface {
          role: Role::Server,
          handle: server_if,
        }),
        Arc::new(IpAddressElement::new(Role::Server, Arc::new(server_driver.clone()))),
      ],
    );
    let client = chain_of(
      Role::Client,
      &store,
      vec![
        Arc::new(IpAddressElement::new(Role::Client, Arc::new(client_driver.clone()))),
        Arc::new(WithInterface {
          role: Role::Client,
          handle: client_if,
        }),
        Arc::new(server),
      ],
    );
    let src: IpPrefix = "10.0.0.1/32".parse().unwrap();
    let dst: IpPrefix = "10.0.0.2/32".parse().unwrap();
    let mut conn = Connection::new("c1", "svc");
    conn.context.ip.src_addresses = vec![src];
    conn.context.ip.dst_addresses = vec![dst];
    client.request(&RequestContext::background(), conn).await.unwrap();
    assert_eq!(client_driver.record(client_if).unwrap().addresses, vec![src]);
    assert_eq!(server_driver.record(server_if).unwrap().addresses, vec![dst]);
  }
}
