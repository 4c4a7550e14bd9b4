// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The connection record carried through a chain, and the role an element is bound to.

use std::{
  collections::BTreeMap,
  net::IpAddr,
  str::FromStr,
  sync::Arc,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Stable identifier of a connection; never changes once assigned.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[repr(transparent)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
  pub fn new<T: Into<String>>(t: T) -> ConnectionId {
    ConnectionId(Arc::from(t.into()))
  }

  /// Generates a random identifier for callers which have none of their own
  pub fn generate() -> ConnectionId {
    Self::new(uuid::Uuid::new_v4().to_string())
  }

  pub fn raw(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ConnectionId").field(&self.raw()).finish()
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.raw())
  }
}

impl From<&str> for ConnectionId {
  fn from(s: &str) -> Self {
    Self::new(s)
  }
}

impl Serialize for ConnectionId {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(self.raw())
  }
}

impl<'de> Deserialize<'de> for ConnectionId {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s: String = Deserialize::deserialize(deserializer)?;
    Ok(ConnectionId::new(s))
  }
}

/// Which side of a connection an element acts for.
///
/// Every element is bound to one role at construction and only touches that role's
/// metadata partition, which lets one element type serve in either chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Client,
  Server,
}

impl Role {
  pub fn is_client(self) -> bool {
    matches!(self, Role::Client)
  }
}

impl std::fmt::Display for Role {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Role::Client => f.write_str("client"),
      Role::Server => f.write_str("server"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
  Kernel,
  Memif,
  Vxlan,
  Wireguard,
  IpInIp,
  Other(String),
}

/// Well-known [`Mechanism`] parameter names
pub mod params {
  pub const SRC_IP: &str = "src_ip";
  pub const DST_IP: &str = "dst_ip";
  pub const SRC_PORT: &str = "src_port";
  pub const DST_PORT: &str = "dst_port";
  pub const VNI: &str = "vni";
  pub const PUBLIC_KEY: &str = "public_key";
  pub const PEER_PUBLIC_KEY: &str = "peer_public_key";
  pub const NAME: &str = "name";
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
  #[error("Mechanism parameter {0} is missing")]
  Missing(&'static str),
  #[error("Mechanism parameter {name} has an invalid value {value:?}")]
  Invalid { name: &'static str, value: String },
}

/// The transport a connection is carried over, with its negotiated parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
  pub kind: MechanismKind,
  #[serde(default)]
  pub parameters: BTreeMap<String, String>,
}

impl Mechanism {
  pub fn new(kind: MechanismKind) -> Self {
    Self {
      kind,
      parameters: BTreeMap::new(),
    }
  }

  pub fn with_parameter(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.parameters.insert(name.into(), value.to_string());
    self
  }

  pub fn parameter(&self, name: &str) -> Option<&str> {
    self.parameters.get(name).map(String::as_str)
  }

  pub fn set_parameter(&mut self, name: impl Into<String>, value: impl ToString) {
    self.parameters.insert(name.into(), value.to_string());
  }

  /// Parses an optional parameter, failing only when present but malformed
  pub fn parse_parameter<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ParameterError> {
    match self.parameter(name) {
      None => Ok(None),
      Some(raw) => raw.parse().map(Some).map_err(|_| ParameterError::Invalid {
        name,
        value: raw.to_string(),
      }),
    }
  }

  pub fn require_parameter<T: FromStr>(&self, name: &'static str) -> Result<T, ParameterError> {
    self
      .parse_parameter(name)?
      .ok_or(ParameterError::Missing(name))
  }
}

/// IP version of an address, used to key per-family dataplane state
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
  Ipv4,
  Ipv6,
}

impl AddressFamily {
  pub fn of(addr: &IpAddr) -> Self {
    match addr {
      IpAddr::V4(_) => AddressFamily::Ipv4,
      IpAddr::V6(_) => AddressFamily::Ipv6,
    }
  }
}

impl std::fmt::Display for AddressFamily {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      AddressFamily::Ipv4 => f.write_str("ipv4"),
      AddressFamily::Ipv6 => f.write_str("ipv6"),
    }
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid IP prefix {0:?}")]
pub struct IpPrefixParseError(String);

/// An address with its prefix length, such as `10.0.0.1/32`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpPrefix {
  addr: IpAddr,
  prefix_len: u8,
}

impl IpPrefix {
  pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix_len > max {
      return None;
    }
    Some(Self { addr, prefix_len })
  }

  pub fn host(addr: IpAddr) -> Self {
    let prefix_len = if addr.is_ipv4() { 32 } else { 128 };
    Self { addr, prefix_len }
  }

  pub fn addr(&self) -> IpAddr {
    self.addr
  }

  pub fn prefix_len(&self) -> u8 {
    self.prefix_len
  }

  pub fn family(&self) -> AddressFamily {
    AddressFamily::of(&self.addr)
  }
}

impl FromStr for IpPrefix {
  type Err = IpPrefixParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let err = || IpPrefixParseError(s.to_string());
    match s.split_once('/') {
      None => s.parse::<IpAddr>().map(Self::host).map_err(|_| err()),
      Some((addr, len)) => {
        let addr = addr.parse::<IpAddr>().map_err(|_| err())?;
        let len = len.parse::<u8>().map_err(|_| err())?;
        Self::new(addr, len).ok_or_else(err)
      }
    }
  }
}

impl std::fmt::Display for IpPrefix {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}/{}", self.addr, self.prefix_len)
  }
}

impl Serialize for IpPrefix {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for IpPrefix {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpContext {
  #[serde(default)]
  pub src_addresses: Vec<IpPrefix>,
  #[serde(default)]
  pub dst_addresses: Vec<IpPrefix>,
  #[serde(default)]
  pub src_routes: Vec<IpPrefix>,
  #[serde(default)]
  pub dst_routes: Vec<IpPrefix>,
}

impl IpContext {
  /// Addresses which the given role assigns to its own interface
  pub fn addresses_for(&self, role: Role) -> &[IpPrefix] {
    match role {
      Role::Client => &self.src_addresses,
      Role::Server => &self.dst_addresses,
    }
  }

  pub fn all_addresses(&self) -> impl Iterator<Item = &IpPrefix> {
    self
      .src_addresses
      .iter()
      .chain(self.dst_addresses.iter())
      .chain(self.src_routes.iter())
      .chain(self.dst_routes.iter())
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetContext {
  #[serde(default)]
  pub src_mac: Option<String>,
  #[serde(default)]
  pub dst_mac: Option<String>,
  /// 802.1Q tag; 0 when untagged
  #[serde(default)]
  pub vlan_tag: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
  #[serde(default)]
  pub ip: IpContext,
  #[serde(default)]
  pub ethernet: EthernetContext,
  /// Proposed or negotiated MTU; 0 means nobody has proposed one yet
  #[serde(default)]
  pub mtu: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
  pub name: String,
  pub id: String,
  #[serde(default)]
  pub token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
  pub index: u32,
  #[serde(default)]
  pub segments: Vec<PathSegment>,
}

impl Path {
  pub fn current(&self) -> Option<&PathSegment> {
    self.segments.get(self.index as usize)
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionValidationError {
  #[error("Connection id is empty")]
  EmptyId,
  #[error("Connection has no network service")]
  EmptyNetworkService,
  #[error("Path index {index} is outside of the {len} traversed segments")]
  PathIndexOutOfRange { index: u32, len: usize },
}

/// One end-to-end network path instance being established or torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
  pub id: ConnectionId,
  pub network_service: String,
  #[serde(default)]
  pub mechanism: Option<Mechanism>,
  #[serde(default)]
  pub context: ConnectionContext,
  #[serde(default)]
  pub path: Path,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
}

impl Connection {
  pub fn new(id: impl Into<ConnectionId>, network_service: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      network_service: network_service.into(),
      mechanism: None,
      context: Default::default(),
      path: Default::default(),
      labels: Default::default(),
    }
  }

  pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
    self.mechanism = Some(mechanism);
    self
  }

  pub fn mechanism_kind(&self) -> Option<&MechanismKind> {
    self.mechanism.as_ref().map(|m| &m.kind)
  }

  pub fn validate(&self) -> Result<(), ConnectionValidationError> {
    if self.id.raw().is_empty() {
      return Err(ConnectionValidationError::EmptyId);
    }
    if self.network_service.is_empty() {
      return Err(ConnectionValidationError::EmptyNetworkService);
    }
    if !self.path.segments.is_empty() && self.path.current().is_none() {
      return Err(ConnectionValidationError::PathIndexOutOfRange {
        index: self.path.index,
        len: self.path.segments.len(),
      });
    }
    Ok(())
  }
}

impl From<String> for ConnectionId {
  fn from(s: String) -> Self {
    Self::new(s)
  }
}
