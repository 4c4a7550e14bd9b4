// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The consumed interface of the dataplane engine
//!
//! Drivers are opaque to the rest of the crate: their failures are carried as [DriverError] and
//! wrapped with the operation that raised them. Every call receives the request's
//! [RequestContext] and is expected to return promptly once it is cancelled or past its deadline.

use std::net::IpAddr;

use futures::{future::BoxFuture, stream::BoxStream};
use serde::{Deserialize, Serialize};

use crate::{
  common::{
    connection::{AddressFamily, IpPrefix, MechanismKind},
    context::RequestContext,
  },
  ext::future::Interrupted,
};

mod handle;
pub mod memory;

pub use handle::{HandleGenerator, MonotonicAtomicGenerator, ResourceHandle};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  Interface,
  Loopback,
  RoutingTable,
  BridgeDomain,
  AclRuleSet,
  Tunnel,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelKind {
  Vxlan,
  Wireguard,
  IpInIp,
}

impl std::fmt::Display for TunnelKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TunnelKind::Vxlan => f.write_str("vxlan"),
      TunnelKind::Wireguard => f.write_str("wireguard"),
      TunnelKind::IpInIp => f.write_str("ipip"),
    }
  }
}

impl TunnelKind {
  pub fn from_mechanism(kind: &MechanismKind) -> Option<Self> {
    match kind {
      MechanismKind::Vxlan => Some(TunnelKind::Vxlan),
      MechanismKind::Wireguard => Some(TunnelKind::Wireguard),
      MechanismKind::IpInIp => Some(TunnelKind::IpInIp),
      _ => None,
    }
  }

  pub fn mechanism(self) -> MechanismKind {
    match self {
      TunnelKind::Vxlan => MechanismKind::Vxlan,
      TunnelKind::Wireguard => MechanismKind::Wireguard,
      TunnelKind::IpInIp => MechanismKind::IpInIp,
    }
  }

  /// UDP port the tunnel listens on unless the mechanism names another; IP-in-IP has none
  pub fn default_port(self) -> Option<u16> {
    match self {
      TunnelKind::Vxlan => Some(4789),
      TunnelKind::Wireguard => Some(51820),
      TunnelKind::IpInIp => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
  pub kind: TunnelKind,
  pub src: IpAddr,
  pub dst: IpAddr,
  pub vni: Option<u32>,
  pub port: Option<u16>,
  pub public_key: Option<String>,
  pub peer_public_key: Option<String>,
}

/// Permits UDP traffic towards `destination:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclRule {
  pub destination: IpPrefix,
  pub port: u16,
}

/// What to create, which also determines the [ResourceKind] created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceSpec {
  Loopback { tag: String },
  RoutingTable { family: AddressFamily, tag: String },
  BridgeDomain { vlan: u16, members: Vec<ResourceHandle> },
  AclRuleSet { tag: String, rules: Vec<AclRule> },
  Tunnel(TunnelSpec),
}

impl ResourceSpec {
  pub fn kind(&self) -> ResourceKind {
    match self {
      ResourceSpec::Loopback { .. } => ResourceKind::Loopback,
      ResourceSpec::RoutingTable { .. } => ResourceKind::RoutingTable,
      ResourceSpec::BridgeDomain { .. } => ResourceKind::BridgeDomain,
      ResourceSpec::AclRuleSet { .. } => ResourceKind::AclRuleSet,
      ResourceSpec::Tunnel(_) => ResourceKind::Tunnel,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
  AdminUp(bool),
  Mtu(u32),
  IpAddress(IpPrefix),
  /// Binds an interface to a routing table of the table's family
  RoutingTable(ResourceHandle),
  /// Adds an interface to a bridge domain; set on the bridge domain
  BridgeMember(ResourceHandle),
  /// Removes an interface from a bridge domain; set on the bridge domain
  RemoveBridgeMember(ResourceHandle),
}

impl Attribute {
  pub fn name(&self) -> &'static str {
    match self {
      Attribute::AdminUp(_) => "admin_up",
      Attribute::Mtu(_) => "mtu",
      Attribute::IpAddress(_) => "ip_address",
      Attribute::RoutingTable(_) => "routing_table",
      Attribute::BridgeMember(_) => "bridge_member",
      Attribute::RemoveBridgeMember(_) => "remove_bridge_member",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpFilter {
  All,
  Kind(ResourceKind),
  Handle(ResourceHandle),
  /// Interfaces holding the given address
  InterfaceByAddress(IpAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpRecord {
  pub handle: ResourceHandle,
  pub kind: ResourceKind,
  pub name: Option<String>,
  pub mtu: Option<u32>,
  pub admin_up: bool,
  pub link_up: bool,
  pub addresses: Vec<IpPrefix>,
  /// Interfaces joined to a bridge domain
  pub members: Vec<ResourceHandle>,
  pub routing_tables: Vec<ResourceHandle>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
  InterfaceState,
  TunnelPeer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
  InterfaceState { handle: ResourceHandle, link_up: bool },
  PeerEstablished { handle: ResourceHandle },
  /// Events were dropped because the subscriber fell behind
  Lagged(u64),
}

impl DriverEvent {
  pub fn event_type(&self) -> Option<EventType> {
    match self {
      DriverEvent::InterfaceState { .. } => Some(EventType::InterfaceState),
      DriverEvent::PeerEstablished { .. } => Some(EventType::TunnelPeer),
      DriverEvent::Lagged(_) => None,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
  #[error("Driver call interrupted")]
  Interrupted(#[from] Interrupted),
  #[error("Resource {0} does not exist")]
  NotFound(ResourceHandle),
  #[error("Event subscription ended")]
  SubscriptionClosed,
  #[error(transparent)]
  Dataplane(#[from] anyhow::Error),
}

impl DriverError {
  pub fn dataplane(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
    Self::Dataplane(anyhow::Error::msg(message))
  }

  pub fn is_interrupted(&self) -> bool {
    matches!(self, DriverError::Interrupted(_))
  }
}

/// Control API of the packet-processing engine
#[cfg_attr(test, mockall::automock)]
pub trait DataplaneDriver: Send + Sync {
  /// Creates a resource of `spec`'s [kind](ResourceSpec::kind) from `spec`'s parameters
  fn create_resource(
    &self,
    ctx: &RequestContext,
    spec: ResourceSpec,
  ) -> BoxFuture<'static, Result<ResourceHandle, DriverError>>;

  fn delete_resource(
    &self,
    ctx: &RequestContext,
    handle: ResourceHandle,
  ) -> BoxFuture<'static, Result<(), DriverError>>;

  fn set_attribute(
    &self,
    ctx: &RequestContext,
    handle: ResourceHandle,
    attribute: Attribute,
  ) -> BoxFuture<'static, Result<(), DriverError>>;

  fn dump(
    &self,
    ctx: &RequestContext,
    filter: DumpFilter,
  ) -> BoxStream<'static, Result<DumpRecord, DriverError>>;

  /// Subscribes to events of one type; only events raised after subscription are delivered
  fn subscribe_event(
    &self,
    ctx: &RequestContext,
    event_type: EventType,
  ) -> BoxFuture<'static, Result<BoxStream<'static, DriverEvent>, DriverError>>;
}
