// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Detached contexts for cleanup that must outlive the request which triggered it
//!
//! An element snapshots its context with [RequestContext::postpone] *before* delegating
//! downstream. If the downstream then fails, [Postponed::context] produces a fresh context which
//! still reaches the same metadata partitions, but which the original request's cancellation can no
//! longer interrupt. Its deadline is derived anew from the snapshot's budget, so cleanup is still
//! bounded.

use std::time::Duration;

use tokio::time::Instant;

use crate::common::context::{MetadataScopes, RequestContext};

/// Snapshot of a context's metadata access, without its cancellation or deadline
#[derive(Debug, Clone)]
pub struct Postponed {
  metadata: MetadataScopes,
  budget: Duration,
  rollback_budget: Duration,
}

impl Postponed {
  /// Time allowed to any context made from this snapshot
  pub fn budget(&self) -> Duration {
    self.budget
  }

  /// Creates a context bounded only by this snapshot's budget, starting now
  pub fn context(&self) -> RequestContext {
    RequestContext::detached(
      self.metadata.clone(),
      Some(Instant::now() + self.budget),
      self.rollback_budget,
    )
  }
}

impl RequestContext {
  /// Snapshots this context for later cleanup
  ///
  /// The budget is whatever time this context has left at the moment of the snapshot, or the
  /// configured rollback timeout when there is no deadline or it has already passed.
  pub fn postpone(&self) -> Postponed {
    let budget = match self.remaining() {
      Some(remaining) if !remaining.is_zero() => remaining,
      _ => self.rollback_budget(),
    };
    Postponed {
      metadata: self.metadata.clone(),
      budget,
      rollback_budget: self.rollback_budget(),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::Arc, time::Duration};

  use tokio_util::sync::CancellationToken;

  use crate::{
    common::{
      connection::Role,
      context::RequestContext,
      metadata::{Metadata, MetadataKey},
    },
    config::ChainConfig,
  };

  struct Marker;
  impl MetadataKey for Marker {
    type Value = &'static str;
  }

  #[tokio::test(start_paused = true)]
  async fn postponed_context_survives_cancellation() {
    let token = CancellationToken::new();
    let metadata = Arc::new(Metadata::new());
    metadata.store::<Marker>("written during request");
    let ctx = RequestContext::new(token.clone())
      .with_timeout(Duration::from_secs(3))
      .with_metadata(Role::Server, metadata);

    let postponed = ctx.postpone();
    token.cancel();
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(ctx.check().is_err());

    let rollback = postponed.context();
    assert_eq!(rollback.check(), Ok(()));
    assert_eq!(postponed.budget(), Duration::from_secs(3));
    assert_eq!(
      rollback.metadata(Role::Server).unwrap().load::<Marker>(),
      Some("written during request")
    );
  }

  #[tokio::test(start_paused = true)]
  async fn unbounded_context_uses_configured_budget() {
    let config: ChainConfig = serde_json::from_str(r#"{ "rollback_timeout_ms": 750 }"#).unwrap();
    let ctx = RequestContext::background().with_config(&config);
    let postponed = ctx.postpone();
    assert_eq!(postponed.budget(), Duration::from_millis(750));
    let rollback = postponed.context();
    assert_eq!(rollback.remaining(), Some(Duration::from_millis(750)));
  }
}
