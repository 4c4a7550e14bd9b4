// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod chain;
pub mod connection;
pub mod context;
pub mod driver;
pub mod metadata;
pub mod mtu;
pub mod postpone;
pub mod registry;

pub mod prelude {
  pub use super::chain::{Chain, ChainElement, ChainError, Next};
  pub use super::connection::{Connection, ConnectionId, Mechanism, MechanismKind, Role};
  pub use super::context::RequestContext;
  pub use super::driver::{DataplaneDriver, DriverError, ResourceHandle};
}
