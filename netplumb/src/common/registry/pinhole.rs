// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! ACL pinholes admitting tunnel traffic
//!
//! Unlike the other shared resources, a pinhole is not reference-counted: once a (address, port)
//! pair has been opened it stays open for every later tunnel using it, until it is removed
//! explicitly. The set only guarantees each pair is programmed once.

use std::{net::IpAddr, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::common::{
  connection::IpPrefix,
  context::RequestContext,
  driver::{AclRule, DataplaneDriver, DriverError, ResourceHandle, ResourceSpec},
};

pub type Pinhole = (IpAddr, u16);

#[derive(Default)]
struct Slot {
  programmed: Option<ResourceHandle>,
  /// Set once the slot has left the map
  retired: bool,
}

type SharedSlot = Arc<Mutex<Slot>>;

/// A locked, live slot; a slot left with nothing programmed leaves the map when unlocked
struct Locked<'s> {
  open: &'s DashMap<Pinhole, SharedSlot>,
  pinhole: Pinhole,
  slot: SharedSlot,
  guard: OwnedMutexGuard<Slot>,
}

impl<'s> Drop for Locked<'s> {
  fn drop(&mut self) {
    if self.guard.retired || self.guard.programmed.is_some() {
      return;
    }
    self.guard.retired = true;
    let slot = &self.slot;
    self
      .open
      .remove_if(&self.pinhole, |_, current| Arc::ptr_eq(current, slot));
  }
}

pub struct PinholeSet {
  driver: Arc<dyn DataplaneDriver>,
  open: DashMap<Pinhole, SharedSlot>,
}

impl std::fmt::Debug for PinholeSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PinholeSet")
      .field("open", &self.open.len())
      .finish()
  }
}

impl PinholeSet {
  pub fn new(driver: Arc<dyn DataplaneDriver>) -> Self {
    Self {
      driver,
      open: DashMap::new(),
    }
  }

  async fn lock(&self, pinhole: Pinhole, slot: SharedSlot) -> Locked<'_> {
    let guard = Arc::clone(&slot).lock_owned().await;
    Locked {
      open: &self.open,
      pinhole,
      slot,
      guard,
    }
  }

  async fn lock_or_install(&self, pinhole: Pinhole) -> Locked<'_> {
    loop {
      let slot = Arc::clone(self.open.entry(pinhole).or_default().value());
      let locked = self.lock(pinhole, slot).await;
      if !locked.guard.retired {
        return locked;
      }
    }
  }

  async fn lock_existing(&self, pinhole: Pinhole) -> Option<Locked<'_>> {
    loop {
      let slot = Arc::clone(self.open.get(&pinhole)?.value());
      let locked = self.lock(pinhole, slot).await;
      if !locked.guard.retired {
        return Some(locked);
      }
    }
  }

  /// Opens the pinhole unless it is open already, returning its rule set
  pub async fn ensure(
    &self,
    ctx: &RequestContext,
    addr: IpAddr,
    port: u16,
  ) -> Result<ResourceHandle, DriverError> {
    let mut locked = self.lock_or_install((addr, port)).await;
    if let Some(handle) = locked.guard.programmed {
      return Ok(handle);
    }
    let spec = ResourceSpec::AclRuleSet {
      tag: format!("{}-{}", addr, port),
      rules: vec![AclRule {
        destination: IpPrefix::host(addr),
        port,
      }],
    };
    let handle = self.driver.create_resource(ctx, spec).await?;
    tracing::debug!(%addr, port, %handle, "opened pinhole");
    locked.guard.programmed = Some(handle);
    Ok(handle)
  }

  pub async fn contains(&self, addr: IpAddr, port: u16) -> bool {
    match self.lock_existing((addr, port)).await {
      Some(locked) => locked.guard.programmed.is_some(),
      None => false,
    }
  }

  /// Closes one pinhole; returns whether it was open
  ///
  /// The pinhole is forgotten even when the driver fails to remove its rule set.
  pub async fn remove(&self, ctx: &RequestContext, addr: IpAddr, port: u16) -> Result<bool, DriverError> {
    let mut locked = match self.lock_existing((addr, port)).await {
      Some(locked) => locked,
      None => return Ok(false),
    };
    let handle = match locked.guard.programmed.take() {
      Some(handle) => handle,
      None => return Ok(false),
    };
    self.driver.delete_resource(ctx, handle).await?;
    tracing::info!(%addr, port, %handle, "closed pinhole");
    Ok(true)
  }

  /// Closes every open pinhole, continuing past failures; returns the first failure
  pub async fn purge(&self, ctx: &RequestContext) -> Result<usize, DriverError> {
    let pinholes: Vec<Pinhole> = self.open.iter().map(|entry| *entry.key()).collect();
    let mut closed = 0;
    let mut first_error = None;
    for (addr, port) in pinholes {
      match self.remove(ctx, addr, port).await {
        Ok(true) => closed += 1,
        Ok(false) => {}
        Err(e) => {
          tracing::warn!(%addr, port, error = %e, "failed to close pinhole");
          first_error.get_or_insert(e);
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(closed),
    }
  }

  /// Number of pinholes known to the set, including any being opened
  pub fn len(&self) -> usize {
    self.open.len()
  }

  pub fn is_empty(&self) -> bool {
    self.open.is_empty()
  }
}
