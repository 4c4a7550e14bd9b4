// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! A dataplane which lives entirely in process memory
//!
//! Keeps resource records in a map, counts creations and deletions per kind, and can be told to
//! fail chosen operations. Interfaces report link-up as soon as they are set admin-up, and secure
//! tunnels report their peer as established on creation, unless configured otherwise.

use std::{
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  time::Duration,
};

use dashmap::DashMap;
use futures::{
  future::{self, BoxFuture, FutureExt},
  stream::{self, BoxStream, StreamExt},
};
use tokio::sync::broadcast::{channel as event_channel, Sender as Broadcaster};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use super::{
  Attribute, DataplaneDriver, DriverError, DriverEvent, DumpFilter, DumpRecord, EventType,
  MonotonicAtomicGenerator, ResourceHandle, ResourceKind, ResourceSpec, TunnelKind,
};
use crate::common::{connection::IpPrefix, context::RequestContext};

const EVENT_CAPACITY: usize = 256;

/// An operation which [InMemoryDriver::fail] can make fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
  Create(ResourceKind),
  Delete(ResourceKind),
  /// Setting an attribute, by [name](Attribute::name)
  SetAttribute(&'static str),
  Dump,
  Subscribe,
}

struct Inner {
  handles: MonotonicAtomicGenerator,
  resources: DashMap<ResourceHandle, DumpRecord>,
  created: DashMap<ResourceKind, usize>,
  deleted: DashMap<ResourceKind, usize>,
  faults: DashMap<FaultPoint, usize>,
  events: Broadcaster<DriverEvent>,
  latency: Option<Duration>,
  auto_link_up: AtomicBool,
  auto_peer: AtomicBool,
}

/// In-process [DataplaneDriver]; clones share the same dataplane
#[derive(Clone)]
pub struct InMemoryDriver {
  inner: Arc<Inner>,
}

impl Default for InMemoryDriver {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for InMemoryDriver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("InMemoryDriver")
      .field("resources", &self.inner.resources.len())
      .finish_non_exhaustive()
  }
}

impl InMemoryDriver {
  pub fn new() -> Self {
    Self::build(None)
  }

  /// A driver whose every call takes `latency` before it takes effect
  pub fn with_latency(latency: Duration) -> Self {
    Self::build(Some(latency))
  }

  fn build(latency: Option<Duration>) -> Self {
    let (events, _) = event_channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(Inner {
        handles: MonotonicAtomicGenerator::default(),
        resources: DashMap::new(),
        created: DashMap::new(),
        deleted: DashMap::new(),
        faults: DashMap::new(),
        events,
        latency,
        auto_link_up: AtomicBool::new(true),
        auto_peer: AtomicBool::new(true),
      }),
    }
  }

  /// Adds a pre-existing physical interface which is already up, such as a tunnel endpoint
  pub fn add_interface(&self, name: impl Into<String>, address: IpPrefix, mtu: u32) -> ResourceHandle {
    let handle = self.inner.handles.next();
    let dump = DumpRecord {
      handle,
      kind: ResourceKind::Interface,
      name: Some(name.into()),
      mtu: Some(mtu),
      admin_up: true,
      link_up: true,
      addresses: vec![address],
      members: Vec::new(),
      routing_tables: Vec::new(),
    };
    self.inner.resources.insert(handle, dump);
    handle
  }

  /// Makes the next `times` attempts at `point` fail with a dataplane error
  pub fn fail(&self, point: FaultPoint, times: usize) {
    *self.inner.faults.entry(point).or_default() += times;
  }

  pub fn set_auto_link_up(&self, enabled: bool) {
    self.inner.auto_link_up.store(enabled, Ordering::SeqCst);
  }

  pub fn set_auto_peer(&self, enabled: bool) {
    self.inner.auto_peer.store(enabled, Ordering::SeqCst);
  }

  /// Changes an interface's link state as if the carrier had changed
  pub fn set_link_state(&self, handle: ResourceHandle, link_up: bool) -> Result<(), DriverError> {
    self.inner.set_link_state(handle, link_up)
  }

  /// Reports a secure tunnel's handshake as complete
  pub fn establish_peer(&self, handle: ResourceHandle) -> Result<(), DriverError> {
    if !self.inner.resources.contains_key(&handle) {
      return Err(DriverError::NotFound(handle));
    }
    self.inner.emit(DriverEvent::PeerEstablished { handle });
    Ok(())
  }

  pub fn created(&self, kind: ResourceKind) -> usize {
    self.inner.created.get(&kind).map(|c| *c).unwrap_or(0)
  }

  pub fn deleted(&self, kind: ResourceKind) -> usize {
    self.inner.deleted.get(&kind).map(|c| *c).unwrap_or(0)
  }

  /// Number of live resources of a kind
  pub fn count(&self, kind: ResourceKind) -> usize {
    self
      .inner
      .resources
      .iter()
      .filter(|r| r.value().kind == kind)
      .count()
  }

  pub fn record(&self, handle: ResourceHandle) -> Option<DumpRecord> {
    self.inner.resources.get(&handle).map(|r| r.value().clone())
  }
}

impl Inner {
  fn emit(&self, event: DriverEvent) {
    // Having no subscribers is not an error
    let _ = self.events.send(event);
  }

  fn take_fault(&self, point: FaultPoint) -> Result<(), DriverError> {
    let mut remaining = match self.faults.get_mut(&point) {
      Some(remaining) => remaining,
      None => return Ok(()),
    };
    if *remaining == 0 {
      return Ok(());
    }
    *remaining -= 1;
    Err(DriverError::dataplane(format!("injected fault at {:?}", point)))
  }

  async fn settle(&self) {
    if let Some(latency) = self.latency {
      tokio::time::sleep(latency).await;
    }
  }

  fn kind_of(&self, handle: ResourceHandle) -> Result<ResourceKind, DriverError> {
    self
      .resources
      .get(&handle)
      .map(|r| r.value().kind)
      .ok_or(DriverError::NotFound(handle))
  }

  fn create(&self, spec: ResourceSpec) -> Result<ResourceHandle, DriverError> {
    let kind = spec.kind();
    self.take_fault(FaultPoint::Create(kind))?;
    let handle = self.handles.next();
    let (name, members, tunnel) = match spec {
      ResourceSpec::Loopback { tag } => (format!("loop-{}", tag), Vec::new(), None),
      ResourceSpec::RoutingTable { family, tag } => (format!("vrf-{}-{}", tag, family), Vec::new(), None),
      ResourceSpec::BridgeDomain { vlan, members } => {
        for member in &members {
          self.kind_of(*member)?;
        }
        (format!("bd-{}", vlan), members, None)
      }
      ResourceSpec::AclRuleSet { tag, .. } => (format!("acl-{}", tag), Vec::new(), None),
      ResourceSpec::Tunnel(tunnel) => (format!("{}{}", tunnel.kind, handle.inner()), Vec::new(), Some(tunnel.kind)),
    };
    let dump = DumpRecord {
      handle,
      kind,
      name: Some(name),
      mtu: None,
      admin_up: false,
      link_up: false,
      addresses: Vec::new(),
      members,
      routing_tables: Vec::new(),
    };
    self.resources.insert(handle, dump);
    *self.created.entry(kind).or_default() += 1;
    if tunnel == Some(TunnelKind::Wireguard) && self.auto_peer.load(Ordering::SeqCst) {
      self.emit(DriverEvent::PeerEstablished { handle });
    }
    Ok(handle)
  }

  fn delete(&self, handle: ResourceHandle) -> Result<(), DriverError> {
    let kind = self.kind_of(handle)?;
    self.take_fault(FaultPoint::Delete(kind))?;
    self.resources.remove(&handle);
    for mut record in self.resources.iter_mut() {
      record.members.retain(|m| *m != handle);
      record.routing_tables.retain(|t| *t != handle);
    }
    *self.deleted.entry(kind).or_default() += 1;
    Ok(())
  }

  fn set_attribute(&self, handle: ResourceHandle, attribute: Attribute) -> Result<(), DriverError> {
    self.take_fault(FaultPoint::SetAttribute(attribute.name()))?;
    let table_kind = match &attribute {
      Attribute::RoutingTable(table) => Some(self.kind_of(*table)?),
      Attribute::BridgeMember(member) => {
        self.kind_of(*member)?;
        None
      }
      _ => None,
    };
    let mut link_change = None;
    {
      let mut dump = self
        .resources
        .get_mut(&handle)
        .ok_or(DriverError::NotFound(handle))?;
      match attribute {
        Attribute::AdminUp(up) => {
          dump.admin_up = up;
          if self.auto_link_up.load(Ordering::SeqCst) && dump.link_up != up {
            dump.link_up = up;
            link_change = Some(up);
          }
        }
        Attribute::Mtu(mtu) => dump.mtu = Some(mtu),
        Attribute::IpAddress(prefix) => {
          if !dump.addresses.contains(&prefix) {
            dump.addresses.push(prefix);
          }
        }
        Attribute::RoutingTable(table) => {
          if table_kind != Some(ResourceKind::RoutingTable) {
            return Err(DriverError::dataplane(format!("{} is not a routing table", table)));
          }
          if !dump.routing_tables.contains(&table) {
            dump.routing_tables.push(table);
          }
        }
        Attribute::BridgeMember(member) => {
          if dump.kind != ResourceKind::BridgeDomain {
            return Err(DriverError::dataplane(format!("{} is not a bridge domain", handle)));
          }
          if !dump.members.contains(&member) {
            dump.members.push(member);
          }
        }
        Attribute::RemoveBridgeMember(member) => dump.members.retain(|m| *m != member),
      }
    }
    if let Some(link_up) = link_change {
      self.emit(DriverEvent::InterfaceState { handle, link_up });
    }
    Ok(())
  }

  fn set_link_state(&self, handle: ResourceHandle, link_up: bool) -> Result<(), DriverError> {
    {
      let mut record = self
        .resources
        .get_mut(&handle)
        .ok_or(DriverError::NotFound(handle))?;
      record.link_up = link_up;
    }
    self.emit(DriverEvent::InterfaceState { handle, link_up });
    Ok(())
  }

  fn dump(&self, filter: &DumpFilter) -> Result<Vec<DumpRecord>, DriverError> {
    self.take_fault(FaultPoint::Dump)?;
    let mut records: Vec<DumpRecord> = self
      .resources
      .iter()
      .map(|r| r.value().clone())
      .filter(|dump| match filter {
        DumpFilter::All => true,
        DumpFilter::Kind(kind) => dump.kind == *kind,
        DumpFilter::Handle(handle) => dump.handle == *handle,
        DumpFilter::InterfaceByAddress(addr) => dump.addresses.iter().any(|p| p.addr() == *addr),
      })
      .collect();
    records.sort_by_key(|dump| dump.handle);
    Ok(records)
  }
}

impl DataplaneDriver for InMemoryDriver {
  fn create_resource(
    &self,
    ctx: &RequestContext,
    spec: ResourceSpec,
  ) -> BoxFuture<'static, Result<ResourceHandle, DriverError>> {
    let inner = Arc::clone(&self.inner);
    let ctx = ctx.clone();
    async move {
      ctx.check()?;
      ctx.run(inner.settle()).await?;
      inner.create(spec)
    }
    .boxed()
  }

  fn delete_resource(
    &self,
    ctx: &RequestContext,
    handle: ResourceHandle,
  ) -> BoxFuture<'static, Result<(), DriverError>> {
    let inner = Arc::clone(&self.inner);
    let ctx = ctx.clone();
    async move {
      ctx.check()?;
      ctx.run(inner.settle()).await?;
      inner.delete(handle)
    }
    .boxed()
  }

  fn set_attribute(
    &self,
    ctx: &RequestContext,
    handle: ResourceHandle,
    attribute: Attribute,
  ) -> BoxFuture<'static, Result<(), DriverError>> {
    let inner = Arc::clone(&self.inner);
    let ctx = ctx.clone();
    async move {
      ctx.check()?;
      ctx.run(inner.settle()).await?;
      inner.set_attribute(handle, attribute)
    }
    .boxed()
  }

  fn dump(
    &self,
    ctx: &RequestContext,
    filter: DumpFilter,
  ) -> BoxStream<'static, Result<DumpRecord, DriverError>> {
    let inner = Arc::clone(&self.inner);
    let ctx = ctx.clone();
    let records = async move {
      ctx.check()?;
      ctx.run(inner.settle()).await?;
      inner.dump(&filter)
    };
    stream::once(records)
      .map(|records| match records {
        Ok(records) => stream::iter(records.into_iter().map(Ok)).boxed(),
        Err(e) => stream::once(future::ready(Err(e))).boxed(),
      })
      .flatten()
      .boxed()
  }

  fn subscribe_event(
    &self,
    ctx: &RequestContext,
    event_type: EventType,
  ) -> BoxFuture<'static, Result<BoxStream<'static, DriverEvent>, DriverError>> {
    // Subscribe eagerly so that nothing raised after this call is missed
    let subscription = ctx
      .check()
      .map_err(DriverError::from)
      .and_then(|()| self.inner.take_fault(FaultPoint::Subscribe))
      .map(|()| self.inner.events.subscribe());
    let events = subscription.map(|receiver| {
      BroadcastStream::new(receiver)
        .filter_map(move |event| {
          future::ready(match event {
            Ok(event) if event.event_type() == Some(event_type) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => Some(DriverEvent::Lagged(missed)),
          })
        })
        .boxed()
    });
    future::ready(events).boxed()
  }
}
