// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client and server chains run end to end, each over its own in-memory dataplane

use std::{net::IpAddr, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::{
  common::{
    chain::{ArcElement, Chain, ChainElement, ChainError, ChainResult, Next},
    connection::{params, Connection, Mechanism, MechanismKind, Role},
    context::RequestContext,
    driver::{
      memory::{FaultPoint, InMemoryDriver},
      DataplaneDriver, ResourceHandle, ResourceKind, TunnelKind,
    },
    metadata::{keys, MetadataStore},
    mtu::TunnelMtu,
    registry::{
      bridge_domain::BridgeDomainRegistry, loopback::LoopbackRegistry, pinhole::PinholeSet,
      vrf::VrfRegistry,
    },
  },
  config::ChainConfig,
  elements::{
    BridgeDomainElement, IpAddressElement, LoopbackElement, MetadataElement, MtuElement,
    PinholeElement, TunnelElement, UpElement, VrfElement,
  },
};

fn init_tracing() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("netplumb=debug"));
  // Several tests share the process; only the first one installs the subscriber
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_test_writer()
    .try_init();
}

/// Everything one side of a connection programs into
struct Side {
  role: Role,
  endpoint: IpAddr,
  uplink: ResourceHandle,
  driver: InMemoryDriver,
  store: Arc<MetadataStore>,
  mtu: Arc<TunnelMtu>,
  loopbacks: Arc<LoopbackRegistry>,
  vrfs: Arc<VrfRegistry>,
  bridges: Arc<BridgeDomainRegistry>,
  pinholes: Arc<PinholeSet>,
  config: ChainConfig,
}

impl Side {
  fn new(role: Role, endpoint: &str, endpoint_mtu: u32) -> Self {
    let config = ChainConfig::default();
    let driver = InMemoryDriver::new();
    let prefix = format!("{}/24", endpoint);
    let uplink = driver.add_interface("eth0", prefix.parse().unwrap(), endpoint_mtu);
    let endpoint: IpAddr = endpoint.parse().unwrap();
    let shared: Arc<dyn DataplaneDriver> = Arc::new(driver.clone());
    Self {
      role,
      endpoint,
      uplink,
      mtu: Arc::new(TunnelMtu::new(Arc::clone(&shared), TunnelKind::Vxlan, endpoint, &config)),
      loopbacks: Arc::new(LoopbackRegistry::new(Arc::clone(&shared))),
      vrfs: Arc::new(VrfRegistry::new(Arc::clone(&shared))),
      bridges: Arc::new(BridgeDomainRegistry::new(Arc::clone(&shared))),
      pinholes: Arc::new(PinholeSet::new(shared)),
      store: Arc::new(MetadataStore::new()),
      driver,
      config,
    }
  }

  fn client() -> Self {
    Self::new(Role::Client, "192.0.2.1", 1500)
  }

  fn server() -> Self {
    Self::new(Role::Server, "192.0.2.2", 1500)
  }

  fn shared_driver(&self) -> Arc<dyn DataplaneDriver> {
    Arc::new(self.driver.clone())
  }

  fn metadata(&self) -> ArcElement {
    Arc::new(MetadataElement::new(self.role, Arc::clone(&self.store)))
  }

  fn tunnel(&self) -> ArcElement {
    Arc::new(TunnelElement::new(
      self.role,
      TunnelKind::Vxlan,
      self.endpoint,
      self.shared_driver(),
      &self.config,
    ))
  }

  fn pinhole(&self) -> ArcElement {
    Arc::new(PinholeElement::new(self.role, Arc::clone(&self.pinholes)))
  }

  fn bridge_domain(&self) -> ArcElement {
    Arc::new(BridgeDomainElement::new(
      self.role,
      self.uplink,
      Arc::clone(&self.bridges),
      self.shared_driver(),
    ))
  }

  fn mtu(&self) -> ArcElement {
    Arc::new(MtuElement::new(self.role, Arc::clone(&self.mtu), self.shared_driver()))
  }

  fn ip_address(&self) -> ArcElement {
    Arc::new(IpAddressElement::new(self.role, self.shared_driver()))
  }

  fn vrf(&self) -> ArcElement {
    Arc::new(VrfElement::new(self.role, Arc::clone(&self.vrfs), self.shared_driver()))
  }

  fn up(&self) -> ArcElement {
    Arc::new(UpElement::new(self.role, self.shared_driver(), &self.config))
  }

  /// The server chain, optionally followed by `tail`
  fn server_chain(&self, tail: Option<ArcElement>) -> Chain {
    let elements: Vec<ArcElement> = vec![
      self.metadata(),
      self.tunnel(),
      self.pinhole(),
      self.bridge_domain(),
      self.mtu(),
      self.ip_address(),
      self.vrf(),
      self.up(),
    ];
    elements
      .into_iter()
      .chain(tail)
      .fold(Chain::builder(Role::Server).named("server"), |builder, element| {
        builder.with_arc(element)
      })
      .build()
  }

  /// The client chain, continuing into `server` as a peer across the wire would
  fn client_chain(&self, server: Chain) -> Chain {
    let elements: Vec<ArcElement> = vec![
      self.metadata(),
      Arc::new(LoopbackElement::new(self.role, Arc::clone(&self.loopbacks))),
      self.up(),
      self.vrf(),
      self.ip_address(),
      self.mtu(),
      self.bridge_domain(),
      self.pinhole(),
      self.tunnel(),
      Arc::new(server),
    ];
    elements
      .into_iter()
      .fold(Chain::builder(Role::Client).named("client"), |builder, element| {
        builder.with_arc(element)
      })
      .build()
  }

  fn interface(&self, connection: &Connection) -> Option<ResourceHandle> {
    self.store.load::<keys::Interface>(&connection.id, self.role)
  }

  /// Asserts that no per-connection state is left on this side
  fn assert_clean(&self) {
    assert!(self.store.is_empty(), "{} metadata left behind", self.role);
    assert!(self.loopbacks.is_empty(), "{} loopback record left behind", self.role);
    assert!(self.vrfs.is_empty(), "{} routing table record left behind", self.role);
    assert!(self.bridges.is_empty(), "{} bridge domain record left behind", self.role);
    for kind in [
      ResourceKind::Tunnel,
      ResourceKind::Loopback,
      ResourceKind::RoutingTable,
      ResourceKind::BridgeDomain,
    ] {
      assert_eq!(self.driver.count(kind), 0, "{} {:?} left behind", self.role, kind);
    }
  }
}

fn connection(id: &str, network_service: &str, vlan: u16) -> Connection {
  let mut conn =
    Connection::new(id, network_service).with_mechanism(Mechanism::new(MechanismKind::Vxlan));
  conn.context.ip.src_addresses = vec!["10.0.0.1/32".parse().unwrap()];
  conn.context.ip.dst_addresses = vec!["10.0.0.2/32".parse().unwrap()];
  conn.context.ethernet.vlan_tag = vlan;
  conn
}

#[tokio::test]
async fn request_then_close_leaves_nothing_behind() {
  init_tracing();
  let client = Side::client();
  let server = Side::server();
  let chain = client.client_chain(server.server_chain(None));
  let ctx = RequestContext::background();

  let conn = chain.request(&ctx, connection("c1", "svc-a", 100)).await.unwrap();
  let mechanism = conn.mechanism.as_ref().unwrap();
  assert_eq!(mechanism.parameter(params::SRC_IP), Some("192.0.2.1"));
  assert_eq!(mechanism.parameter(params::DST_IP), Some("192.0.2.2"));
  assert_eq!(mechanism.parameter(params::VNI), Some("1"));
  for side in [&client, &server] {
    let interface = side.interface(&conn).unwrap();
    let record = side.driver.record(interface).unwrap();
    assert!(record.admin_up && record.link_up);
    assert_eq!(record.routing_tables.len(), 1);
    assert_eq!(side.driver.count(ResourceKind::BridgeDomain), 1);
    assert!(side.pinholes.contains(side.endpoint, 4789).await);
  }
  assert_eq!(client.loopbacks.consumers("svc-a").await, 1);

  chain.close(&ctx, conn).await.unwrap();
  client.assert_clean();
  server.assert_clean();
  assert_eq!(client.driver.deleted(ResourceKind::Tunnel), 1);
  assert_eq!(server.driver.deleted(ResourceKind::Tunnel), 1);
  // Pinholes stay open for later tunnels
  assert!(client.pinholes.contains(client.endpoint, 4789).await);
  assert!(server.pinholes.contains(server.endpoint, 4789).await);
}

#[tokio::test]
async fn connections_of_a_service_share_one_loopback() {
  init_tracing();
  let client = Side::client();
  let server = Side::server();
  let chain = client.client_chain(server.server_chain(None));
  let ctx = RequestContext::background();

  let c1 = chain.request(&ctx, connection("c1", "svc-a", 0)).await.unwrap();
  let c2 = chain.request(&ctx, connection("c2", "svc-a", 0)).await.unwrap();
  assert_eq!(client.driver.created(ResourceKind::Loopback), 1);
  assert_eq!(client.loopbacks.consumers("svc-a").await, 2);

  chain.close(&ctx, c1).await.unwrap();
  assert_eq!(client.driver.count(ResourceKind::Loopback), 1);
  assert_eq!(client.loopbacks.consumers("svc-a").await, 1);

  chain.close(&ctx, c2).await.unwrap();
  assert_eq!(client.driver.deleted(ResourceKind::Loopback), 1);
  client.assert_clean();
  server.assert_clean();
}

#[tokio::test]
async fn mtu_is_clamped_to_the_tunnel_ceiling() {
  init_tracing();
  let client = Side::client();
  let server = Side::server();
  let chain = client.client_chain(server.server_chain(None));
  let ctx = RequestContext::background();

  for (id, proposal) in [("c1", 9000), ("c2", 0)] {
    let mut conn = connection(id, "svc-a", 0);
    conn.context.mtu = proposal;
    let conn = chain.request(&ctx, conn).await.unwrap();
    assert_eq!(conn.context.mtu, 1500 - 54, "proposal {}", proposal);
    let interface = client.interface(&conn).unwrap();
    assert_eq!(client.driver.record(interface).unwrap().mtu, Some(1446));
    chain.close(&ctx, conn).await.unwrap();
  }
}

#[tokio::test]
async fn negotiated_mtu_is_the_least_of_both_sides() {
  init_tracing();
  let client = Side::new(Role::Client, "192.0.2.1", 9000);
  let server = Side::server();
  let chain = client.client_chain(server.server_chain(None));
  let ctx = RequestContext::background();

  let conn = chain.request(&ctx, connection("c1", "svc-a", 0)).await.unwrap();
  assert_eq!(conn.context.mtu, 1446);
  let interface = client.interface(&conn).unwrap();
  assert_eq!(client.driver.record(interface).unwrap().mtu, Some(1446));
}

/// Cancels the request it is part of, then fails it
struct CancelThenFail {
  token: CancellationToken,
}

impl ChainElement for CancelThenFail {
  fn request<'a>(
    &'a self,
    _ctx: &'a RequestContext,
    _connection: Connection,
    _next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    self.token.cancel();
    futures::future::ready(Err(ChainError::validation("cancelled, then refused"))).boxed()
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

#[tokio::test]
async fn rollback_survives_cancellation_of_the_request() {
  init_tracing();
  let client = Side::client();
  let server = Side::server();
  let token = CancellationToken::new();
  let chain = client.client_chain(server.server_chain(Some(Arc::new(CancelThenFail {
    token: token.clone(),
  }))));
  let ctx = RequestContext::new(token.clone());

  let err = chain
    .request(&ctx, connection("c1", "svc-a", 100))
    .await
    .unwrap_err();
  assert!(token.is_cancelled());
  assert!(err.is_validation());
  assert!(err.rollback_error().is_none(), "rollback failed: {}", err);

  // The server's tunnel was found through its metadata and deleted exactly once
  assert_eq!(server.driver.created(ResourceKind::Tunnel), 1);
  assert_eq!(server.driver.deleted(ResourceKind::Tunnel), 1);
  assert_eq!(client.driver.created(ResourceKind::Tunnel), 0);
  assert_eq!(client.driver.deleted(ResourceKind::Loopback), 1);
  client.assert_clean();
  server.assert_clean();
}

#[tokio::test]
async fn client_failure_unwinds_the_server() {
  init_tracing();
  let client = Side::client();
  let server = Side::server();
  client.driver.fail(FaultPoint::Create(ResourceKind::Tunnel), 1);
  let chain = client.client_chain(server.server_chain(None));

  let err = chain
    .request(&RequestContext::background(), connection("c1", "svc-a", 100))
    .await
    .unwrap_err();
  assert!(matches!(err.primary(), ChainError::Driver { .. }));
  assert!(err.rollback_error().is_none(), "rollback failed: {}", err);
  assert_eq!(server.driver.created(ResourceKind::Tunnel), 1);
  assert_eq!(server.driver.deleted(ResourceKind::Tunnel), 1);
  client.assert_clean();
  server.assert_clean();

  // Nothing is left to get in the way of a retry
  let conn = chain
    .request(&RequestContext::background(), connection("c1", "svc-a", 100))
    .await
    .unwrap();
  chain.close(&RequestContext::background(), conn).await.unwrap();
  client.assert_clean();
  server.assert_clean();
}
