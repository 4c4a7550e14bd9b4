// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use futures::Future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
  common::{
    connection::Role,
    metadata::{Metadata, MetadataError},
  },
  config::ChainConfig,
  ext::future::{Bounded, FutureExtExt, Interrupted},
  util::cancellation::CancellationListener,
};

pub use crate::common::postpone::Postponed;

/// Metadata partitions reachable from a context, one slot per role
#[derive(Debug, Clone, Default)]
pub(crate) struct MetadataScopes {
  client: Option<Arc<Metadata>>,
  server: Option<Arc<Metadata>>,
}

impl MetadataScopes {
  fn get(&self, role: Role) -> Option<&Arc<Metadata>> {
    match role {
      Role::Client => self.client.as_ref(),
      Role::Server => self.server.as_ref(),
    }
  }

  fn set(&mut self, role: Role, metadata: Arc<Metadata>) {
    match role {
      Role::Client => self.client = Some(metadata),
      Role::Server => self.server = Some(metadata),
    }
  }
}

/// The ambient state of one request or close as it travels down a chain
///
/// Carries the caller's cancellation signal and deadline, which every driver call honours, and the
/// connection's metadata partitions. Cloning is cheap; derived contexts never widen the deadline.
#[derive(Debug, Clone)]
pub struct RequestContext {
  cancellation: CancellationListener,
  deadline: Option<Instant>,
  pub(crate) metadata: MetadataScopes,
  rollback_budget: Duration,
}

impl RequestContext {
  /// A context cancelled through `token`, with no deadline
  pub fn new(token: CancellationToken) -> Self {
    Self {
      cancellation: token.into(),
      deadline: None,
      metadata: Default::default(),
      rollback_budget: ChainConfig::default().rollback_timeout(),
    }
  }

  /// A context which nothing can cancel, and with no deadline
  pub fn background() -> Self {
    Self::detached(MetadataScopes::default(), None, ChainConfig::default().rollback_timeout())
  }

  pub(crate) fn detached(
    metadata: MetadataScopes,
    deadline: Option<Instant>,
    rollback_budget: Duration,
  ) -> Self {
    Self {
      cancellation: CancellationListener::detached(),
      deadline,
      metadata,
      rollback_budget,
    }
  }

  /// Applies the configured rollback budget to this context and those derived from it
  pub fn with_config(mut self, config: &ChainConfig) -> Self {
    self.rollback_budget = config.rollback_timeout();
    self
  }

  pub fn with_timeout(self, timeout: Duration) -> Self {
    self.with_deadline(Instant::now() + timeout)
  }

  /// Narrows the deadline; a later deadline than the current one is ignored
  pub fn with_deadline(mut self, deadline: Instant) -> Self {
    self.deadline = Some(match self.deadline {
      Some(existing) => existing.min(deadline),
      None => deadline,
    });
    self
  }

  pub fn with_metadata(mut self, role: Role, metadata: Arc<Metadata>) -> Self {
    self.metadata.set(role, metadata);
    self
  }

  pub fn cancellation(&self) -> &CancellationListener {
    &self.cancellation
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// Time left before the deadline, if there is one
  pub fn remaining(&self) -> Option<Duration> {
    self
      .deadline
      .map(|deadline| deadline.saturating_duration_since(Instant::now()))
  }

  pub fn rollback_budget(&self) -> Duration {
    self.rollback_budget
  }

  /// Reports why this context can no longer be used to start work, if it can't
  pub fn check(&self) -> Result<(), Interrupted> {
    if self.cancellation.is_cancelled() {
      return Err(Interrupted::Cancelled);
    }
    match self.deadline {
      Some(deadline) if deadline <= Instant::now() => Err(Interrupted::DeadlineExceeded),
      _ => Ok(()),
    }
  }

  /// Bounds a future by this context's cancellation and deadline
  pub fn run<F: Future>(&self, task: F) -> Bounded<F> {
    task.bounded(&self.cancellation, self.deadline)
  }

  pub fn metadata(&self, role: Role) -> Result<&Arc<Metadata>, MetadataError> {
    self
      .metadata
      .get(role)
      .ok_or(MetadataError::NotScoped { role })
  }
}
