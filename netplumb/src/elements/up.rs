// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use futures::{
  future::{BoxFuture, FutureExt},
  stream::{BoxStream, StreamExt, TryStreamExt},
};

use super::{close_sided, interface, request_sided, tolerate_missing, Sided};
use crate::{
  common::{
    chain::{ChainElement, ChainError, ChainResult, Next},
    connection::{Connection, Role},
    context::RequestContext,
    driver::{Attribute, DataplaneDriver, DriverError, DriverEvent, DumpFilter, EventType, ResourceHandle},
  },
  config::ChainConfig,
};

/// Brings the connection's interface up and waits for its link to follow
pub struct UpElement {
  role: Role,
  driver: Arc<dyn DataplaneDriver>,
  link_up_timeout: Duration,
}

impl UpElement {
  pub fn new(role: Role, driver: Arc<dyn DataplaneDriver>, config: &ChainConfig) -> Self {
    Self {
      role,
      driver,
      link_up_timeout: config.link_up_timeout(),
    }
  }

  async fn link_is_up(&self, ctx: &RequestContext, handle: ResourceHandle) -> Result<bool, DriverError> {
    let records: Vec<_> = self
      .driver
      .dump(ctx, DumpFilter::Handle(handle))
      .try_collect()
      .await?;
    match records.first() {
      Some(record) => Ok(record.link_up),
      None => Err(DriverError::NotFound(handle)),
    }
  }

  async fn await_link_up(
    &self,
    ctx: &RequestContext,
    mut events: BoxStream<'static, DriverEvent>,
    handle: ResourceHandle,
  ) -> Result<(), DriverError> {
    // Subscribed before checking, so a change between the check and the wait is still seen
    if self.link_is_up(ctx, handle).await? {
      return Ok(());
    }
    while let Some(event) = events.next().await {
      match event {
        DriverEvent::InterfaceState {
          handle: changed,
          link_up: true,
        } if changed == handle => return Ok(()),
        DriverEvent::Lagged(_) => {
          if self.link_is_up(ctx, handle).await? {
            return Ok(());
          }
        }
        _ => {}
      }
    }
    Err(DriverError::SubscriptionClosed)
  }

  async fn bring_up(&self, ctx: &RequestContext, handle: ResourceHandle) -> ChainResult<()> {
    let events = self
      .driver
      .subscribe_event(ctx, EventType::InterfaceState)
      .await
      .map_err(|e| ChainError::driver("subscribe to interface events", e))?;
    self
      .driver
      .set_attribute(ctx, handle, Attribute::AdminUp(true))
      .await
      .map_err(|e| ChainError::driver("set interface admin up", e))?;
    let bounded = ctx.clone().with_timeout(self.link_up_timeout);
    bounded
      .run(self.await_link_up(&bounded, events, handle))
      .await?
      .map_err(|e| ChainError::driver("await link up", e))?;
    tracing::debug!(%handle, "interface is up");
    Ok(())
  }
}

impl Sided for UpElement {
  fn name(&self) -> &'static str {
    "up"
  }

  fn role(&self) -> Role {
    self.role
  }

  fn apply<'a>(
    &'a self,
    ctx: &'a RequestContext,
    _connection: &'a mut Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    async move {
      match interface(ctx, self.role)? {
        Some(handle) => self.bring_up(ctx, handle).await,
        None => {
          tracing::trace!("no interface to bring up");
          Ok(())
        }
      }
    }
    .boxed()
  }

  fn undo<'a>(
    &'a self,
    ctx: &'a RequestContext,
    _connection: &'a Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    async move {
      let handle = match interface(ctx, self.role)? {
        Some(handle) => handle,
        None => return Ok(()),
      };
      tolerate_missing(
        self
          .driver
          .set_attribute(ctx, handle, Attribute::AdminUp(false))
          .await,
      )
      .map_err(|e| ChainError::driver("set interface admin down", e))
    }
    .boxed()
  }
}

impl ChainElement for UpElement {
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
