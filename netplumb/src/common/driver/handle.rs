// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};

/// Opaque reference to a resource living in the dataplane, as issued by its driver
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ResourceHandle(u32);

impl ResourceHandle {
  pub fn new(inner: u32) -> ResourceHandle {
    Self(inner)
  }

  pub fn inner(&self) -> u32 {
    self.0
  }
}

impl From<u32> for ResourceHandle {
  fn from(inner: u32) -> Self {
    Self::new(inner)
  }
}

impl From<ResourceHandle> for u32 {
  fn from(handle: ResourceHandle) -> Self {
    handle.inner()
  }
}

impl std::fmt::Debug for ResourceHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ResourceHandle").field(&self.inner()).finish()
  }
}

impl std::fmt::Display for ResourceHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

pub trait HandleGenerator {
  fn next(&self) -> ResourceHandle;
}

/// Issues increasing handles; wraps around after `u32::MAX` allocations
pub struct MonotonicAtomicGenerator {
  next: std::sync::atomic::AtomicU32,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u32) -> Self {
    Self {
      next: std::sync::atomic::AtomicU32::new(next),
    }
  }

  pub fn next(&self) -> ResourceHandle {
    // `Relaxed` because only uniqueness is needed, not ordering
    ResourceHandle::new(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
  }
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    // Handle 0 is conventionally the dataplane's own default table/interface
    Self::new(1)
  }
}

impl HandleGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> ResourceHandle {
    MonotonicAtomicGenerator::next(self)
  }
}
