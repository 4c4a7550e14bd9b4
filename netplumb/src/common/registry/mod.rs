// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Shared, reference-counted dataplane resources
//!
//! A [ResourceRegistry] maps a sharing key to the handle of a resource and the set of connections
//! using it. The resource is created when the first consumer acquires the key and destroyed when
//! the last one releases it. Every operation on a key holds that key's lock for the whole of its
//! bookkeeping *and* its driver call, so a key is never created twice nor destroyed while it is
//! being handed out. Different keys never contend.

use std::{
  collections::HashSet,
  fmt::Debug,
  hash::Hash,
  ops::{Deref, DerefMut},
  sync::Arc,
};

use dashmap::DashMap;
use futures::Future;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::common::connection::ConnectionId;

pub mod bridge_domain;
pub mod loopback;
pub mod pinhole;
pub mod vrf;

#[derive(thiserror::Error, Debug)]
pub enum RegistryError<E: std::error::Error + 'static> {
  /// Nothing was recorded for the key; a later acquisition will retry creation
  #[error("Shared resource creation failed")]
  Create(#[source] E),
  /// The record is gone regardless, but the resource may still exist in the dataplane
  #[error("Shared resource destruction failed")]
  Destroy(#[source] E),
}

/// Outcome of a [release](ResourceRegistry::release)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
  /// The consumer held no reference to the key
  NotAttached,
  /// The consumer was removed, and others still hold the resource
  Detached { remaining: usize },
  /// The consumer was the last one, and the resource has been destroyed
  Destroyed,
}

struct Slot<H> {
  handle: Option<H>,
  consumers: HashSet<ConnectionId>,
  /// Set once the slot has been dropped from the map; holders of a stale slot must look again
  retired: bool,
}

impl<H> Default for Slot<H> {
  fn default() -> Self {
    Self {
      handle: None,
      consumers: HashSet::new(),
      retired: false,
    }
  }
}

type SharedSlot<H> = Arc<Mutex<Slot<H>>>;

/// A locked, live slot
///
/// Leaving the slot empty (no handle, no consumers) retires it when the lock is let go, whether the
/// operation finished or its future was dropped mid-way.
struct Locked<'r, K: Hash + Eq, H> {
  slots: &'r DashMap<K, SharedSlot<H>>,
  key: K,
  slot: SharedSlot<H>,
  guard: OwnedMutexGuard<Slot<H>>,
}

impl<'r, K: Hash + Eq, H> Deref for Locked<'r, K, H> {
  type Target = Slot<H>;

  fn deref(&self) -> &Self::Target {
    &self.guard
  }
}

impl<'r, K: Hash + Eq, H> DerefMut for Locked<'r, K, H> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.guard
  }
}

impl<'r, K: Hash + Eq, H> Drop for Locked<'r, K, H> {
  fn drop(&mut self) {
    if self.guard.retired || self.guard.handle.is_some() || !self.guard.consumers.is_empty() {
      return;
    }
    // Still under the slot lock, so waiters wake to a retired slot and look again
    self.guard.retired = true;
    let slot = &self.slot;
    self
      .slots
      .remove_if(&self.key, |_, current| Arc::ptr_eq(current, slot));
  }
}

pub struct ResourceRegistry<K, H> {
  name: &'static str,
  slots: DashMap<K, SharedSlot<H>>,
}

impl<K: Hash + Eq, H> Debug for ResourceRegistry<K, H> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ResourceRegistry")
      .field("name", &self.name)
      .field("keys", &self.slots.len())
      .finish()
  }
}

impl<K, H> ResourceRegistry<K, H>
where
  K: Hash + Eq + Clone + Debug + Send + Sync,
  H: Clone + Debug + Send,
{
  /// Creates an empty registry; `name` identifies the kind of resource in logs
  pub fn new(name: &'static str) -> Self {
    Self {
      name,
      slots: DashMap::new(),
    }
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  async fn lock(&self, key: &K, slot: SharedSlot<H>) -> Locked<'_, K, H> {
    let guard = Arc::clone(&slot).lock_owned().await;
    Locked {
      slots: &self.slots,
      key: key.clone(),
      slot,
      guard,
    }
  }

  /// Locks the live slot for `key`, installing an empty one if there is none
  async fn lock_or_install(&self, key: &K) -> Locked<'_, K, H> {
    loop {
      let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
      let locked = self.lock(key, slot).await;
      if !locked.retired {
        return locked;
      }
    }
  }

  /// Locks the live slot for `key`, if there is one
  async fn lock_existing(&self, key: &K) -> Option<Locked<'_, K, H>> {
    loop {
      let slot = Arc::clone(self.slots.get(key)?.value());
      let locked = self.lock(key, slot).await;
      if !locked.retired {
        return Some(locked);
      }
    }
  }

  /// Adds `consumer` to `key`, creating the resource through `create` if nobody holds it yet
  ///
  /// `create` is only invoked for the first consumer; if it fails, or is abandoned, nothing is
  /// recorded.
  pub async fn acquire<E, F, Fut>(
    &self,
    key: &K,
    consumer: &ConnectionId,
    create: F,
  ) -> Result<H, RegistryError<E>>
  where
    E: std::error::Error + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<H, E>>,
  {
    let mut slot = self.lock_or_install(key).await;
    if let Some(handle) = slot.handle.clone() {
      slot.consumers.insert(consumer.clone());
      tracing::debug!(registry = self.name, ?key, ?handle, consumer = %consumer, consumers = slot.consumers.len(), "attached to shared resource");
      return Ok(handle);
    }
    match create().await {
      Ok(handle) => {
        slot.handle = Some(handle.clone());
        slot.consumers.insert(consumer.clone());
        tracing::debug!(registry = self.name, ?key, ?handle, consumer = %consumer, "created shared resource");
        Ok(handle)
      }
      Err(e) => {
        tracing::debug!(registry = self.name, ?key, error = %e, "shared resource creation failed");
        Err(RegistryError::Create(e))
      }
    }
  }

  /// Adds `consumer` to an existing resource, without ever creating one
  pub async fn attach(&self, key: &K, consumer: &ConnectionId) -> Option<H> {
    let mut slot = self.lock_existing(key).await?;
    let handle = slot.handle.clone()?;
    slot.consumers.insert(consumer.clone());
    Some(handle)
  }

  /// Removes `consumer` from `key`, destroying the resource through `destroy` if it was the last
  ///
  /// Releasing a consumer which is not attached does nothing. When `destroy` fails, or is
  /// abandoned, the record is removed all the same.
  pub async fn release<E, F, Fut>(
    &self,
    key: &K,
    consumer: &ConnectionId,
    destroy: F,
  ) -> Result<Released, RegistryError<E>>
  where
    E: std::error::Error + 'static,
    F: FnOnce(H) -> Fut,
    Fut: Future<Output = Result<(), E>>,
  {
    let mut slot = match self.lock_existing(key).await {
      Some(slot) => slot,
      None => return Ok(Released::NotAttached),
    };
    if !slot.consumers.remove(consumer) {
      return Ok(Released::NotAttached);
    }
    if !slot.consumers.is_empty() {
      let remaining = slot.consumers.len();
      tracing::debug!(registry = self.name, ?key, consumer = %consumer, remaining, "detached from shared resource");
      return Ok(Released::Detached { remaining });
    }
    let handle = match slot.handle.take() {
      Some(handle) => handle,
      None => return Ok(Released::Destroyed),
    };
    match destroy(handle.clone()).await {
      Ok(()) => {
        tracing::info!(registry = self.name, ?key, ?handle, "destroyed shared resource");
        Ok(Released::Destroyed)
      }
      Err(e) => {
        tracing::warn!(registry = self.name, ?key, error = %e, "shared resource destruction failed; record dropped");
        Err(RegistryError::Destroy(e))
      }
    }
  }

  /// The handle currently recorded for `key`
  pub async fn handle(&self, key: &K) -> Option<H> {
    self.lock_existing(key).await?.handle.clone()
  }

  /// Number of consumers currently holding `key`
  pub async fn consumers(&self, key: &K) -> usize {
    match self.lock_existing(key).await {
      Some(slot) => slot.consumers.len(),
      None => 0,
    }
  }

  /// Number of keys with a record, including any whose creation is underway
  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }
}
