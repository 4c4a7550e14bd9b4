// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection tunnel interfaces
//!
//! Mechanism parameters follow the client's point of view: `src_ip`/`src_port` and `public_key`
//! belong to the client, `dst_ip`/`dst_port` and `peer_public_key` to the server. Each side fills
//! in its own half before the request crosses to the other.

use std::{
  net::IpAddr,
  sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
  },
  time::Duration,
};

use futures::{
  future::{BoxFuture, FutureExt},
  stream::{BoxStream, StreamExt},
};
use tracing_futures::Instrument;

use super::{element_span, tolerate_missing};
use crate::{
  common::{
    chain::{rollback_downstream, ChainElement, ChainError, ChainResult, Next},
    connection::{params, Connection, Mechanism, Role},
    context::RequestContext,
    driver::{
      DataplaneDriver, DriverError, DriverEvent, EventType, ResourceHandle, ResourceSpec,
      TunnelKind, TunnelSpec,
    },
    metadata::keys,
  },
  config::ChainConfig,
};

/// VXLAN network identifiers are 24 bits wide
const MAX_VNI: u32 = 0xFF_FFFF;

pub struct TunnelElement {
  role: Role,
  kind: TunnelKind,
  local: IpAddr,
  driver: Arc<dyn DataplaneDriver>,
  public_key: Option<String>,
  peer_timeout: Duration,
  next_vni: AtomicU32,
}

impl TunnelElement {
  /// Creates `kind` tunnels whose local end is `local`
  pub fn new(
    role: Role,
    kind: TunnelKind,
    local: IpAddr,
    driver: Arc<dyn DataplaneDriver>,
    config: &ChainConfig,
  ) -> Self {
    Self {
      role,
      kind,
      local,
      driver,
      public_key: None,
      peer_timeout: config.peer_established_timeout(),
      next_vni: AtomicU32::new(1),
    }
  }

  /// Sets the key this side presents to secure tunnel peers
  pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
    self.public_key = Some(key.into());
    self
  }

  fn applies_to(&self, connection: &Connection) -> bool {
    connection.mechanism_kind() == Some(&self.kind.mechanism())
  }

  fn own_public_key(&self) -> ChainResult<&str> {
    self
      .public_key
      .as_deref()
      .ok_or_else(|| ChainError::validation("secure tunnel requested but no public key is configured"))
  }

  /// Hands out VNIs from 1 upwards, wrapping back to 1 past the largest one
  fn allocate_vni(&self) -> u32 {
    let next = |vni: u32| Some(if vni >= MAX_VNI { 1 } else { vni + 1 });
    match self.next_vni.fetch_update(Ordering::Relaxed, Ordering::Relaxed, next) {
      Ok(vni) | Err(vni) => vni,
    }
  }

  /// Fills in this side's half of the mechanism parameters, keeping any the caller chose
  fn prepare(&self, mechanism: &mut Mechanism) -> ChainResult<()> {
    let (own_ip, own_key) = match self.role {
      Role::Client => (params::SRC_IP, params::PUBLIC_KEY),
      Role::Server => (params::DST_IP, params::PEER_PUBLIC_KEY),
    };
    if mechanism.parameter(own_ip).is_none() {
      mechanism.set_parameter(own_ip, self.local);
    }
    if self.kind == TunnelKind::Wireguard && mechanism.parameter(own_key).is_none() {
      let key = self.own_public_key()?.to_string();
      mechanism.set_parameter(own_key, key);
    }
    if self.kind == TunnelKind::Vxlan
      && !self.role.is_client()
      && mechanism.parameter(params::VNI).is_none()
    {
      mechanism.set_parameter(params::VNI, self.allocate_vni());
    }
    Ok(())
  }

  fn spec(&self, mechanism: &Mechanism) -> ChainResult<TunnelSpec> {
    let (src_ip, dst_ip, src_port) = match self.role {
      Role::Client => (params::SRC_IP, params::DST_IP, params::SRC_PORT),
      Role::Server => (params::DST_IP, params::SRC_IP, params::DST_PORT),
    };
    let (public_key, peer_public_key) = match self.kind {
      TunnelKind::Wireguard => {
        let (own, peer) = match self.role {
          Role::Client => (params::PUBLIC_KEY, params::PEER_PUBLIC_KEY),
          Role::Server => (params::PEER_PUBLIC_KEY, params::PUBLIC_KEY),
        };
        (
          Some(mechanism.require_parameter(own)?),
          Some(mechanism.require_parameter(peer)?),
        )
      }
      _ => (None, None),
    };
    let vni = match self.kind {
      TunnelKind::Vxlan => Some(mechanism.require_parameter(params::VNI)?),
      _ => None,
    };
    Ok(TunnelSpec {
      kind: self.kind,
      src: mechanism.require_parameter(src_ip)?,
      dst: mechanism.require_parameter(dst_ip)?,
      vni,
      port: mechanism
        .parse_parameter(src_port)?
        .or_else(|| self.kind.default_port()),
      public_key,
      peer_public_key,
    })
  }

  async fn create(&self, ctx: &RequestContext, connection: &Connection) -> ChainResult<ResourceHandle> {
    let mechanism = connection
      .mechanism
      .as_ref()
      .ok_or_else(|| ChainError::validation("tunnel requested without a mechanism"))?;
    let spec = self.spec(mechanism)?;
    let metadata = ctx.metadata(self.role)?;
    if let Some(existing) = metadata.load::<keys::Interface>() {
      tracing::trace!(handle = %existing, "tunnel already exists");
      return Ok(existing);
    }
    // Subscribe before creating, so the handshake can't complete unobserved
    let peer_events = match self.kind {
      TunnelKind::Wireguard => Some(
        self
          .driver
          .subscribe_event(ctx, EventType::TunnelPeer)
          .await
          .map_err(|e| ChainError::driver("subscribe to tunnel peer events", e))?,
      ),
      _ => None,
    };
    let handle = self
      .driver
      .create_resource(ctx, ResourceSpec::Tunnel(spec))
      .await
      .map_err(|e| ChainError::driver("create tunnel", e))?;
    metadata.store::<keys::Interface>(handle);
    tracing::debug!(%handle, kind = %self.kind, "created tunnel interface");
    if let Some(events) = peer_events {
      if let Err(e) = self.await_peer(ctx, events, handle).await {
        let rollback_ctx = ctx.postpone().context();
        return Err(e.with_rollback(self.delete(&rollback_ctx).await));
      }
    }
    Ok(handle)
  }

  async fn await_peer(
    &self,
    ctx: &RequestContext,
    mut events: BoxStream<'static, DriverEvent>,
    handle: ResourceHandle,
  ) -> ChainResult<()> {
    let wait = async move {
      while let Some(event) = events.next().await {
        match event {
          DriverEvent::PeerEstablished { handle: peer } if peer == handle => return Ok(()),
          // Peer state can't be polled, so a lagged subscriber can only keep waiting
          DriverEvent::Lagged(missed) => tracing::warn!(missed, "tunnel peer events lagged"),
          _ => {}
        }
      }
      Err(DriverError::SubscriptionClosed)
    };
    ctx
      .clone()
      .with_timeout(self.peer_timeout)
      .run(wait)
      .await?
      .map_err(|e| ChainError::driver("await tunnel peer", e))
  }

  /// Deletes the tunnel recorded for the connection, if any
  async fn delete(&self, ctx: &RequestContext) -> ChainResult<()> {
    let handle = match ctx.metadata(self.role)?.load_and_delete::<keys::Interface>() {
      Some(handle) => handle,
      None => return Ok(()),
    };
    tolerate_missing(self.driver.delete_resource(ctx, handle).await)
      .map_err(|e| ChainError::driver("delete tunnel", e))?;
    tracing::info!(%handle, kind = %self.kind, "deleted tunnel interface");
    Ok(())
  }
}

impl ChainElement for TunnelElement {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    mut connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    if !self.applies_to(&connection) {
      return next.request(ctx, connection);
    }
    let span = element_span("tunnel", self.role, "request");
    async move {
      if let Some(mechanism) = connection.mechanism.as_mut() {
        self.prepare(mechanism)?;
      }
      let postponed = ctx.postpone();
      match self.role {
        Role::Client => {
          let connection = next.request(ctx, connection).await?;
          match self.create(ctx, &connection).await {
            Ok(_) => Ok(connection),
            Err(e) => {
              let rollback_ctx = postponed.context();
              Err(rollback_downstream(&rollback_ctx, next, connection, e).await)
            }
          }
        }
        Role::Server => {
          self.create(ctx, &connection).await?;
          match next.request(ctx, connection).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
              let rollback_ctx = postponed.context();
              let deleted = self.delete(&rollback_ctx).await;
              if let Err(rollback) = &deleted {
                tracing::error!(error = %rollback, "rollback of tunnel failed");
              }
              Err(e.with_rollback(deleted))
            }
          }
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
    if !self.applies_to(&connection) {
      return next.close(ctx, connection);
    }
    let span = element_span("tunnel", self.role, "close");
    async move {
      let closed = next.close(ctx, connection).await;
      let deleted = self.delete(ctx).await;
      if let Err(e) = &deleted {
        tracing::warn!(error = %e, "tunnel teardown failed");
      }
      closed.and(deleted)
    }
    .instrument(span)
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::{
    net::IpAddr,
    sync::{atomic::Ordering, Arc},
    time::Duration,
  };

  use super::{TunnelElement, MAX_VNI};
  use crate::{
    common::{
      chain::{tests::Failing, ChainError},
      connection::{params, Connection, Mechanism, MechanismKind, Role},
      context::RequestContext,
      driver::{
        memory::{FaultPoint, InMemoryDriver},
        DriverError, ResourceKind, TunnelKind,
      },
      metadata::{keys, MetadataStore},
    },
    config::ChainConfig,
    elements::tests::{chain_of, vxlan_connection},
  };

  fn client_ip() -> IpAddr {
    "192.0.2.1".parse().unwrap()
  }

  fn server_ip() -> IpAddr {
    "192.0.2.2".parse().unwrap()
  }

  fn element(role: Role, kind: TunnelKind, driver: &InMemoryDriver) -> TunnelElement {
    let local = if role.is_client() { client_ip() } else { server_ip() };
    TunnelElement::new(role, kind, local, Arc::new(driver.clone()), &ChainConfig::default())
  }

  #[tokio::test]
  async fn server_fills_in_its_half() {
    let driver = InMemoryDriver::new();
    let store = Arc::new(MetadataStore::new());
    let chain = chain_of(
      Role::Server,
      &store,
      vec![Arc::new(element(Role::Server, TunnelKind::Vxlan, &driver))],
    );
    let conn = Connection::new("c1", "svc").with_mechanism(
      Mechanism::new(MechanismKind::Vxlan).with_parameter(params::SRC_IP, client_ip()),
    );
    let conn = chain.request(&RequestContext::background(), conn).await.unwrap();
    let mechanism = conn.mechanism.as_ref().unwrap();
    assert_eq!(mechanism.parameter(params::DST_IP), Some("192.0.2.2"));
    assert_eq!(mechanism.parameter(params::VNI), Some("1"));
    let handle = store
      .load::<keys::Interface>(&conn.id, Role::Server)
      .unwrap();
    assert_eq!(driver.record(handle).unwrap().kind, ResourceKind::Tunnel);
    chain.close(&RequestContext::background(), conn).await.unwrap();
    assert_eq!(driver.count(ResourceKind::Tunnel), 0);
    assert!(store.is_empty());
  }

  #[test]
  fn vnis_wrap_within_24_bits() {
    let tunnel = element(Role::Server, TunnelKind::Vxlan, &InMemoryDriver::new());
    tunnel.next_vni.store(MAX_VNI, Ordering::Relaxed);
    assert_eq!(tunnel.allocate_vni(), MAX_VNI);
    assert_eq!(tunnel.allocate_vni(), 1);
    assert_eq!(tunnel.allocate_vni(), 2);
  }

  #[tokio::test]
  async fn server_undoes_itself_when_downstream_fails() {
    let driver = InMemoryDriver::new();
    let store = Arc::new(MetadataStore::new());
    let chain = chain_of(
      Role::Server,
      &store,
      vec![
        Arc::new(element(Role::Server, TunnelKind::Vxlan, &driver)),
        Arc::new(Failing::new()),
      ],
    );
    let err = chain
      .request(
        &RequestContext::background(),
        vxlan_connection("c1", client_ip(), server_ip()),
      )
      .await
      .unwrap_err();
    assert!(err.rollback_error().is_none());
    assert_eq!(driver.created(ResourceKind::Tunnel), 1);
    assert_eq!(driver.count(ResourceKind::Tunnel), 0);
  }

  #[tokio::test]
  async fn missing_remote_address_is_a_validation_error() {
    let driver = InMemoryDriver::new();
    let store = Arc::new(MetadataStore::new());
    let chain = chain_of(
      Role::Client,
      &store,
      vec![Arc::new(element(Role::Client, TunnelKind::Vxlan, &driver))],
    );
    let conn = Connection::new("c1", "svc").with_mechanism(
      Mechanism::new(MechanismKind::Vxlan).with_parameter(params::VNI, 7),
    );
    let err = chain
      .request(&RequestContext::background(), conn)
      .await
      .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(driver.created(ResourceKind::Tunnel), 0);
  }

  #[tokio::test]
  async fn other_mechanisms_pass_through() {
    let driver = InMemoryDriver::new();
    let store = Arc::new(MetadataStore::new());
    let chain = chain_of(
      Role::Client,
      &store,
      vec![Arc::new(element(Role::Client, TunnelKind::Wireguard, &driver))],
    );
    chain
      .request(
        &RequestContext::background(),
        vxlan_connection("c1", client_ip(), server_ip()),
      )
      .await
      .unwrap();
    assert_eq!(driver.created(ResourceKind::Tunnel), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn secure_tunnel_without_handshake_is_removed() {
    let driver = InMemoryDriver::new();
    driver.set_auto_peer(false);
    let store = Arc::new(MetadataStore::new());
    let config = ChainConfig {
      peer_established_timeout_ms: 100,
      ..Default::default()
    };
    let tunnel = TunnelElement::new(
      Role::Server,
      TunnelKind::Wireguard,
      server_ip(),
      Arc::new(driver.clone()),
      &config,
    )
    .with_public_key("server-key");
    let chain = chain_of(Role::Server, &store, vec![Arc::new(tunnel)]);
    let conn = Connection::new("c1", "svc").with_mechanism(
      Mechanism::new(MechanismKind::Wireguard)
        .with_parameter(params::SRC_IP, client_ip())
        .with_parameter(params::PUBLIC_KEY, "client-key"),
    );
    let started = tokio::time::Instant::now();
    let err = chain
      .request(&RequestContext::background(), conn)
      .await
      .unwrap_err();
    assert!(matches!(err.primary(), ChainError::Interrupted(_)));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(driver.created(ResourceKind::Tunnel), 1);
    assert_eq!(driver.count(ResourceKind::Tunnel), 0);
  }

  #[tokio::test]
  async fn secure_tunnel_completes_on_handshake() {
    let driver = InMemoryDriver::new();
    let store = Arc::new(MetadataStore::new());
    let client = element(Role::Client, TunnelKind::Wireguard, &driver).with_public_key("client-key");
    let chain = chain_of(Role::Client, &store, vec![Arc::new(client)]);
    let conn = Connection::new("c1", "svc").with_mechanism(
      Mechanism::new(MechanismKind::Wireguard)
        .with_parameter(params::DST_IP, server_ip())
        .with_parameter(params::PEER_PUBLIC_KEY, "server-key"),
    );
    let conn = chain.request(&RequestContext::background(), conn).await.unwrap();
    assert_eq!(
      conn.mechanism.as_ref().unwrap().parameter(params::PUBLIC_KEY),
      Some("client-key")
    );
    assert_eq!(driver.count(ResourceKind::Tunnel), 1);
  }

  #[tokio::test]
  async fn failed_delete_is_reported() {
    let driver = InMemoryDriver::new();
    let store = Arc::new(MetadataStore::new());
    let chain = chain_of(
      Role::Server,
      &store,
      vec![Arc::new(element(Role::Server, TunnelKind::Vxlan, &driver))],
    );
    let ctx = RequestContext::background();
    let conn = chain
      .request(&ctx, vxlan_connection("c1", client_ip(), server_ip()))
      .await
      .unwrap();
    driver.fail(FaultPoint::Delete(ResourceKind::Tunnel), 1);
    let err = chain.close(&ctx, conn.clone()).await.unwrap_err();
    assert!(matches!(
      err,
      ChainError::Driver {
        source: DriverError::Dataplane(_),
        ..
      }
    ));
    assert!(store.is_empty());
    assert_eq!(driver.count(ResourceKind::Tunnel), 1);
  }
}
