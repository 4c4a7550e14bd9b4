// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection, per-role scratch storage shared between the elements of one chain.
//!
//! Values are addressed by a key *type* implementing [MetadataKey]; the key fixes the value type,
//! so one key can never observe a value of another type over the lifetime of a connection.
//! Partitions are created by the [metadata element](crate::elements::metadata) at chain entry and
//! reached through the [RequestContext](crate::common::context::RequestContext) afterwards.

use std::{
  any::{Any, TypeId},
  fmt::Debug,
  sync::Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use downcast_rs::{impl_downcast, DowncastSync};

use crate::common::connection::{ConnectionId, Role};

pub mod keys;

/// Names a slot in a connection's [Metadata] and fixes the type stored in it
pub trait MetadataKey: 'static {
  type Value: Clone + Send + Sync + 'static;
}

/// Type-erased storage for metadata values
pub trait MetadataValue: DowncastSync {}
impl_downcast!(sync MetadataValue);

impl<T: Any + Send + Sync> MetadataValue for T {}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
  #[error("No {role} metadata is scoped for this request; is the metadata element missing from the chain?")]
  NotScoped { role: Role },
}

/// One (connection, role) partition of the [MetadataStore]
#[derive(Default)]
pub struct Metadata {
  values: DashMap<TypeId, Box<dyn MetadataValue>>,
}

impl Debug for Metadata {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Metadata")
      .field("entries", &self.values.len())
      .finish_non_exhaustive()
  }
}

impl Metadata {
  pub fn new() -> Self {
    Self::default()
  }

  fn unpack<K: MetadataKey>(stored: &dyn MetadataValue) -> K::Value {
    stored
      .downcast_ref::<K::Value>()
      .cloned()
      .unwrap_or_else(|| unreachable!("Metadata slots are only ever written with their key's value type"))
  }

  pub fn store<K: MetadataKey>(&self, value: K::Value) {
    self.values.insert(TypeId::of::<K>(), Box::new(value));
  }

  pub fn load<K: MetadataKey>(&self) -> Option<K::Value> {
    self
      .values
      .get(&TypeId::of::<K>())
      .map(|stored| Self::unpack::<K>(stored.value().as_ref()))
  }

  pub fn load_and_delete<K: MetadataKey>(&self) -> Option<K::Value> {
    self
      .values
      .remove(&TypeId::of::<K>())
      .map(|(_, stored)| Self::unpack::<K>(stored.as_ref()))
  }

  /// Returns the existing value and `true`, or stores `value` and returns it with `false`
  pub fn load_or_store<K: MetadataKey>(&self, value: K::Value) -> (K::Value, bool) {
    match self.values.entry(TypeId::of::<K>()) {
      Entry::Occupied(existing) => (Self::unpack::<K>(existing.get().as_ref()), true),
      Entry::Vacant(vacant) => {
        vacant.insert(Box::new(value.clone()));
        (value, false)
      }
    }
  }

  pub fn delete<K: MetadataKey>(&self) {
    self.values.remove(&TypeId::of::<K>());
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

/// Table of metadata partitions indexed by (connection id, role)
#[derive(Default)]
pub struct MetadataStore {
  partitions: DashMap<(ConnectionId, Role), Arc<Metadata>>,
}

impl Debug for MetadataStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MetadataStore")
      .field("partitions", &self.partitions.len())
      .finish()
  }
}

impl MetadataStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fetches the partition for the connection, creating it if absent
  ///
  /// The returned flag is `true` when this call created the partition.
  pub fn scope(&self, id: &ConnectionId, role: Role) -> (Arc<Metadata>, bool) {
    match self.partitions.entry((id.clone(), role)) {
      Entry::Occupied(existing) => (Arc::clone(existing.get()), false),
      Entry::Vacant(vacant) => {
        let partition = Arc::new(Metadata::new());
        vacant.insert(Arc::clone(&partition));
        (partition, true)
      }
    }
  }

  pub fn partition(&self, id: &ConnectionId, role: Role) -> Option<Arc<Metadata>> {
    self
      .partitions
      .get(&(id.clone(), role))
      .map(|p| Arc::clone(p.value()))
  }

  /// Drops the partition of a connection which has fully closed
  pub fn release(&self, id: &ConnectionId, role: Role) -> Option<Arc<Metadata>> {
    self.partitions.remove(&(id.clone(), role)).map(|(_, p)| p)
  }

  pub fn store<K: MetadataKey>(&self, id: &ConnectionId, role: Role, value: K::Value) {
    self.scope(id, role).0.store::<K>(value)
  }

  pub fn load<K: MetadataKey>(&self, id: &ConnectionId, role: Role) -> Option<K::Value> {
    self.partition(id, role).and_then(|p| p.load::<K>())
  }

  pub fn load_and_delete<K: MetadataKey>(&self, id: &ConnectionId, role: Role) -> Option<K::Value> {
    self.partition(id, role).and_then(|p| p.load_and_delete::<K>())
  }

  pub fn load_or_store<K: MetadataKey>(
    &self,
    id: &ConnectionId,
    role: Role,
    value: K::Value,
  ) -> (K::Value, bool) {
    self.scope(id, role).0.load_or_store::<K>(value)
  }

  pub fn len(&self) -> usize {
    self.partitions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.partitions.is_empty()
  }
}
