// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tunnel MTU ceilings and per-connection MTU negotiation
//!
//! The ceiling is what fits through a tunnel: the MTU of the interface holding the tunnel's local
//! endpoint address, less the encapsulation overhead of the tunnel kind. It is computed once per
//! [TunnelMtu] and then shared by every connection through that endpoint.

use std::{net::IpAddr, sync::Arc};

use futures::TryStreamExt;
use tokio::sync::OnceCell;

pub use crate::common::{connection::AddressFamily, driver::TunnelKind};
use crate::{
  common::{
    context::RequestContext,
    driver::{DataplaneDriver, DriverError, DumpFilter},
  },
  config::{ChainConfig, MIN_MTU},
  ext::future::Interrupted,
};

/// Bytes of encapsulation added in front of a tunnelled frame
pub fn overhead(kind: TunnelKind, family: AddressFamily) -> u32 {
  match (kind, family) {
    // outer IP + UDP 8 + VXLAN 8 + inner Ethernet 14 + 802.1Q 4
    (TunnelKind::Vxlan, AddressFamily::Ipv4) => 54,
    (TunnelKind::Vxlan, AddressFamily::Ipv6) => 74,
    // outer IP + UDP 8 + WireGuard header 16 + auth tag 16
    (TunnelKind::Wireguard, AddressFamily::Ipv4) => 60,
    (TunnelKind::Wireguard, AddressFamily::Ipv6) => 80,
    (TunnelKind::IpInIp, AddressFamily::Ipv4) => 20,
    (TunnelKind::IpInIp, AddressFamily::Ipv6) => 40,
  }
}

/// Clamps a proposal to `ceiling`; a proposal of zero means "no preference"
pub fn negotiate(proposed: u32, ceiling: u32) -> u32 {
  if proposed == 0 || proposed > ceiling {
    ceiling
  } else {
    proposed
  }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum MtuError {
  #[error("Tunnel MTU computation interrupted")]
  Interrupted(#[from] Interrupted),
  #[error("Endpoint interface query failed")]
  Driver(#[source] Arc<DriverError>),
  #[error("No interface holds tunnel endpoint address {0}")]
  NoEndpointInterface(IpAddr),
  #[error("Endpoint interface for {0} reports no MTU")]
  NoInterfaceMtu(IpAddr),
  #[error("Endpoint MTU {mtu} leaves less than {} bytes after {overhead} bytes of overhead", MIN_MTU)]
  TooSmall { mtu: u32, overhead: u32 },
}

impl From<DriverError> for MtuError {
  fn from(e: DriverError) -> Self {
    match e {
      DriverError::Interrupted(interrupted) => MtuError::Interrupted(interrupted),
      other => MtuError::Driver(Arc::new(other)),
    }
  }
}

/// Lazily computed MTU ceiling of one tunnel kind at one local endpoint
///
/// The first caller computes and publishes the result; callers arriving meanwhile wait for it, and
/// later callers read it without touching the driver. Every outcome is published, failures
/// included. The computation runs under a context detached from the first caller, so cancelling
/// that caller cannot cut it short; it is bounded by the time that caller had left, or by the
/// rollback timeout when it had no deadline.
pub struct TunnelMtu {
  driver: Arc<dyn DataplaneDriver>,
  kind: TunnelKind,
  endpoint: IpAddr,
  ceiling_override: Option<u32>,
  ceiling: OnceCell<Result<u32, MtuError>>,
}

impl std::fmt::Debug for TunnelMtu {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TunnelMtu")
      .field("kind", &self.kind)
      .field("endpoint", &self.endpoint)
      .field("ceiling", &self.ceiling.get())
      .finish()
  }
}

impl TunnelMtu {
  pub fn new(
    driver: Arc<dyn DataplaneDriver>,
    kind: TunnelKind,
    endpoint: IpAddr,
    config: &ChainConfig,
  ) -> Self {
    Self {
      driver,
      kind,
      endpoint,
      ceiling_override: config.mtu_ceiling_override,
      ceiling: OnceCell::new(),
    }
  }

  pub fn kind(&self) -> TunnelKind {
    self.kind
  }

  pub fn endpoint(&self) -> IpAddr {
    self.endpoint
  }

  pub async fn get_or_compute(&self, ctx: &RequestContext) -> Result<u32, MtuError> {
    self
      .ceiling
      .get_or_init(|| async {
        let detached = ctx.postpone().context();
        self.compute(&detached).await
      })
      .await
      .clone()
  }

  async fn compute(&self, ctx: &RequestContext) -> Result<u32, MtuError> {
    if let Some(ceiling) = self.ceiling_override {
      tracing::debug!(ceiling, kind = %self.kind, "using configured tunnel MTU ceiling");
      return Ok(ceiling);
    }
    let records = ctx
      .run(
        self
          .driver
          .dump(ctx, DumpFilter::InterfaceByAddress(self.endpoint))
          .try_collect::<Vec<_>>(),
      )
      .await??;
    let interface = records
      .into_iter()
      .next()
      .ok_or(MtuError::NoEndpointInterface(self.endpoint))?;
    let mtu = interface
      .mtu
      .ok_or(MtuError::NoInterfaceMtu(self.endpoint))?;
    let overhead = overhead(self.kind, AddressFamily::of(&self.endpoint));
    let ceiling = mtu
      .checked_sub(overhead)
      .filter(|ceiling| *ceiling >= MIN_MTU)
      .ok_or(MtuError::TooSmall { mtu, overhead })?;
    tracing::debug!(
      ceiling,
      mtu,
      overhead,
      kind = %self.kind,
      endpoint = %self.endpoint,
      "computed tunnel MTU ceiling"
    );
    Ok(ceiling)
  }
}
