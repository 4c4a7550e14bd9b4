// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Metadata keys read by more than one element

use super::MetadataKey;
use crate::common::driver::ResourceHandle;

/// The dataplane interface carrying this connection on the element's side
pub struct Interface;

impl MetadataKey for Interface {
  type Value = ResourceHandle;
}

/// The shared bridge domain the connection's interface was added to
pub struct BridgeDomain;

impl MetadataKey for BridgeDomain {
  type Value = ResourceHandle;
}
