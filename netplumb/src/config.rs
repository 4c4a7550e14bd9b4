// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest MTU an IPv4 host must accept; also the floor for a configured ceiling
pub const MIN_MTU: u32 = 576;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Configuration could not be parsed")]
  Parse(#[from] serde_json::Error),
  #[error("{0} must be greater than zero")]
  ZeroTimeout(&'static str),
  #[error("MTU ceiling {0} is below the minimum of {}", MIN_MTU)]
  CeilingTooSmall(u32),
}

/// Tunables shared by the elements of a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainConfig {
  /// Budget for rollback when the failed request carried no deadline
  pub rollback_timeout_ms: u64,
  /// Upper bound on waiting for an interface to report link-up
  pub link_up_timeout_ms: u64,
  /// Upper bound on waiting for a secure tunnel's peer to complete its handshake
  pub peer_established_timeout_ms: u64,
  /// Fixed tunnel MTU ceiling, bypassing the endpoint interface query
  pub mtu_ceiling_override: Option<u32>,
}

impl Default for ChainConfig {
  fn default() -> Self {
    Self {
      rollback_timeout_ms: 15_000,
      link_up_timeout_ms: 10_000,
      peer_established_timeout_ms: 10_000,
      mtu_ceiling_override: None,
    }
  }
}

impl ChainConfig {
  pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(raw)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.rollback_timeout_ms == 0 {
      return Err(ConfigError::ZeroTimeout("rollback_timeout_ms"));
    }
    if self.link_up_timeout_ms == 0 {
      return Err(ConfigError::ZeroTimeout("link_up_timeout_ms"));
    }
    if self.peer_established_timeout_ms == 0 {
      return Err(ConfigError::ZeroTimeout("peer_established_timeout_ms"));
    }
    match self.mtu_ceiling_override {
      Some(ceiling) if ceiling < MIN_MTU => Err(ConfigError::CeilingTooSmall(ceiling)),
      _ => Ok(()),
    }
  }

  pub fn rollback_timeout(&self) -> Duration {
    Duration::from_millis(self.rollback_timeout_ms)
  }

  pub fn link_up_timeout(&self) -> Duration {
    Duration::from_millis(self.link_up_timeout_ms)
  }

  pub fn peer_established_timeout(&self) -> Duration {
    Duration::from_millis(self.peer_established_timeout_ms)
  }
}
