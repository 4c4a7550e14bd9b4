// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Ordered composition of request/close handlers
//!
//! Each [ChainElement] receives the remainder of its chain as a [Next] continuation and is free to
//! call it before its own work, after it, both, or not at all. `close` travels the chain in the same
//! order as `request`; elements keep their teardown idempotent instead of relying on reverse order.

use std::{borrow::Cow, fmt::Debug, sync::Arc};

use futures::future::{BoxFuture, FutureExt};
use tracing_futures::Instrument;

use crate::{
  common::{
    connection::{Connection, ConnectionValidationError, ParameterError, Role},
    context::RequestContext,
    driver::DriverError,
    metadata::MetadataError,
    mtu::MtuError,
    registry::RegistryError,
  },
  ext::future::Interrupted,
};

pub mod switch;

#[derive(thiserror::Error, Debug)]
pub enum ChainError {
  #[error("Invalid connection")]
  InvalidConnection(#[from] ConnectionValidationError),
  #[error("Invalid mechanism")]
  InvalidParameter(#[from] ParameterError),
  #[error("Invalid request: {0}")]
  Validation(Cow<'static, str>),
  #[error(transparent)]
  Metadata(#[from] MetadataError),
  #[error("Dataplane operation {operation} failed")]
  Driver {
    operation: Cow<'static, str>,
    #[source]
    source: DriverError,
  },
  #[error("Tunnel MTU unavailable")]
  Mtu(#[from] MtuError),
  #[error(transparent)]
  Registry(#[from] RegistryError<DriverError>),
  #[error("Request interrupted")]
  Interrupted(#[from] Interrupted),
  /// A primary failure whose rollback failed as well; the primary error stays the source
  #[error("{primary} (rollback also failed: {rollback})")]
  RollbackFailed {
    #[source]
    primary: Box<ChainError>,
    rollback: Box<ChainError>,
  },
}

impl ChainError {
  pub fn driver(operation: impl Into<Cow<'static, str>>, source: DriverError) -> Self {
    Self::Driver {
      operation: operation.into(),
      source,
    }
  }

  pub fn validation(reason: impl Into<Cow<'static, str>>) -> Self {
    Self::Validation(reason.into())
  }

  /// Attaches the outcome of a rollback to this, the primary error
  ///
  /// A successful rollback leaves the error untouched; a failed one never replaces it.
  pub fn with_rollback(self, rollback: Result<(), ChainError>) -> Self {
    match rollback {
      Ok(()) => self,
      Err(rollback) => Self::RollbackFailed {
        primary: Box::new(self),
        rollback: Box::new(rollback),
      },
    }
  }

  /// The failure which caused this error, looking through any attached rollback failures
  pub fn primary(&self) -> &ChainError {
    match self {
      Self::RollbackFailed { primary, .. } => primary.primary(),
      other => other,
    }
  }

  pub fn rollback_error(&self) -> Option<&ChainError> {
    match self {
      Self::RollbackFailed { rollback, .. } => Some(rollback),
      _ => None,
    }
  }

  /// Whether the failure is due to the request itself, rather than the dataplane
  pub fn is_validation(&self) -> bool {
    matches!(
      self.primary(),
      Self::InvalidConnection(_) | Self::InvalidParameter(_) | Self::Validation(_) | Self::Metadata(_)
    )
  }
}

pub type ChainResult<T> = Result<T, ChainError>;

/// A unit of request/close behaviour composed into a [Chain]
pub trait ChainElement: Send + Sync {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>>;

  fn close<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<()>>;
}

pub type ArcElement = Arc<dyn ChainElement + 'static>;

/// The remainder of a chain, from the point of view of the element holding it
///
/// A chain nested inside another continues into the outer chain's remainder once its own elements
/// run out, so nesting is invisible to the elements involved.
#[derive(Clone, Copy)]
pub struct Next<'a> {
  elements: &'a [ArcElement],
  tail: Option<&'a Next<'a>>,
}

impl<'a> Next<'a> {
  pub fn new(elements: &'a [ArcElement]) -> Self {
    Self {
      elements,
      tail: None,
    }
  }

  /// The terminal continuation, which hands the connection straight back
  pub fn end() -> Next<'static> {
    Next {
      elements: &[],
      tail: None,
    }
  }

  /// Runs `elements`, then continues with `tail`
  pub fn then(elements: &'a [ArcElement], tail: &'a Next<'a>) -> Self {
    Self {
      elements,
      tail: Some(tail),
    }
  }

  pub fn request(
    self,
    ctx: &'a RequestContext,
    connection: Connection,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    match self.elements.split_first() {
      Some((head, rest)) => head.request(
        ctx,
        connection,
        Next {
          elements: rest,
          tail: self.tail,
        },
      ),
      None => match self.tail {
        Some(tail) => tail.request(ctx, connection),
        None => futures::future::ready(Ok(connection)).boxed(),
      },
    }
  }

  pub fn close(self, ctx: &'a RequestContext, connection: Connection) -> BoxFuture<'a, ChainResult<()>> {
    match self.elements.split_first() {
      Some((head, rest)) => head.close(
        ctx,
        connection,
        Next {
          elements: rest,
          tail: self.tail,
        },
      ),
      None => match self.tail {
        Some(tail) => tail.close(ctx, connection),
        None => futures::future::ready(Ok(())).boxed(),
      },
    }
  }
}

/// An ordered sequence of elements acting for one role
pub struct Chain {
  role: Role,
  name: Cow<'static, str>,
  elements: Vec<ArcElement>,
}

impl Debug for Chain {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Chain")
      .field("role", &self.role)
      .field("name", &self.name)
      .field("elements", &self.elements.len())
      .finish()
  }
}

impl Chain {
  pub fn builder(role: Role) -> ChainBuilder {
    ChainBuilder {
      role,
      name: Cow::Borrowed("chain"),
      elements: Vec::new(),
    }
  }

  pub fn role(&self) -> Role {
    self.role
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }

  /// Runs a request through the whole chain
  pub fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    ChainElement::request(self, ctx, connection, Next::end())
  }

  /// Runs a close through the whole chain
  pub fn close<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
  ) -> BoxFuture<'a, ChainResult<()>> {
    ChainElement::close(self, ctx, connection, Next::end())
  }

  fn span(&self, op: &'static str, connection: &Connection) -> tracing::Span {
    tracing::debug_span!(
      "chain",
      name = %self.name,
      role = %self.role,
      op,
      connection = %connection.id
    )
  }
}

impl ChainElement for Chain {
  fn request<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<Connection>> {
    let span = self.span("request", &connection);
    async move {
      connection.validate()?;
      let result = Next::then(&self.elements, &next).request(ctx, connection).await;
      if let Err(e) = &result {
        tracing::debug!(error = %e, "chain request failed");
      }
      result
    }
    .instrument(span)
    .boxed()
  }

  fn close<'a>(
    &'a self,
    ctx: &'a RequestContext,
    connection: Connection,
    next: Next<'a>,
  ) -> BoxFuture<'a, ChainResult<()>> {
    let span = self.span("close", &connection);
    async move {
      let result = Next::then(&self.elements, &next).close(ctx, connection).await;
      if let Err(e) = &result {
        tracing::debug!(error = %e, "chain close failed");
      }
      result
    }
    .instrument(span)
    .boxed()
  }
}

pub struct ChainBuilder {
  role: Role,
  name: Cow<'static, str>,
  elements: Vec<ArcElement>,
}

impl ChainBuilder {
  pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with<E: ChainElement + 'static>(mut self, element: E) -> Self {
    self.elements.push(Arc::new(element));
    self
  }

  pub fn with_arc(mut self, element: ArcElement) -> Self {
    self.elements.push(element);
    self
  }

  pub fn build(self) -> Chain {
    Chain {
      role: self.role,
      name: self.name,
      elements: self.elements,
    }
  }
}

/// Closes an element's downstream on behalf of a request that failed after it had succeeded
///
/// Used by elements which act after delegating: the downstream already holds state for the
/// connection, so the element's own failure must unwind it. Runs under `rollback_ctx`, which is
/// expected to come from a [Postponed](crate::common::postpone::Postponed) snapshot.
pub async fn rollback_downstream<'a>(
  rollback_ctx: &'a RequestContext,
  next: Next<'a>,
  connection: Connection,
  primary: ChainError,
) -> ChainError {
  let rollback = next.close(rollback_ctx, connection).await;
  if let Err(e) = &rollback {
    tracing::error!(error = %e, primary = %primary, "rollback of downstream failed");
  }
  primary.with_rollback(rollback)
}

#[cfg(test)]
pub(crate) mod tests {
  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
  };

  use futures::future::{BoxFuture, FutureExt};

  use super::{Chain, ChainElement, ChainError, ChainResult, Next};
  use crate::common::{
    connection::{Connection, Role},
    context::RequestContext,
  };

  /// Records the order in which elements see requests and closes
  #[derive(Clone)]
  pub(crate) struct Recorder {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<String>>>,
  }

  impl ChainElement for Recorder {
    fn request<'a>(
      &'a self,
      ctx: &'a RequestContext,
      mut connection: Connection,
      next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Connection>> {
      async move {
        self.log.lock().unwrap().push(format!("request:{}", self.name));
        connection.labels.insert(self.name.to_string(), "seen".into());
        next.request(ctx, connection).await
      }
      .boxed()
    }

    fn close<'a>(
      &'a self,
      ctx: &'a RequestContext,
      connection: Connection,
      next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<()>> {
      async move {
        self.log.lock().unwrap().push(format!("close:{}", self.name));
        next.close(ctx, connection).await
      }
      .boxed()
    }
  }

  /// Fails every request without delegating; closes pass through
  pub(crate) struct Failing {
    pub requests: AtomicUsize,
  }

  impl Failing {
    pub fn new() -> Self {
      Self {
        requests: AtomicUsize::new(0),
      }
    }
  }

  impl ChainElement for Failing {
    fn request<'a>(
      &'a self,
      _ctx: &'a RequestContext,
      _connection: Connection,
      _next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Connection>> {
      self.requests.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(Err(ChainError::validation("refused by test element"))).boxed()
    }

    fn close<'a>(
      &'a self,
      ctx: &'a RequestContext,
      connection: Connection,
      next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<()>> {
      next.close(ctx, connection)
    }
  }

  fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Recorder {
    Recorder {
      name,
      log: Arc::clone(log),
    }
  }

  #[tokio::test]
  async fn request_and_close_travel_in_the_same_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let chain = Chain::builder(Role::Client)
      .with(recorder("a", &log))
      .with(recorder("b", &log))
      .build();
    let ctx = RequestContext::background();
    let conn = chain
      .request(&ctx, Connection::new("c1", "svc"))
      .await
      .unwrap();
    assert_eq!(conn.labels.len(), 2);
    chain.close(&ctx, conn).await.unwrap();
    assert_eq!(
      *log.lock().unwrap(),
      vec!["request:a", "request:b", "close:a", "close:b"]
    );
  }

  #[tokio::test]
  async fn nested_chain_continues_into_outer_remainder() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner = Chain::builder(Role::Server)
      .with(recorder("inner", &log))
      .build();
    let outer = Chain::builder(Role::Server)
      .with(recorder("first", &log))
      .with(inner)
      .with(recorder("last", &log))
      .build();
    let ctx = RequestContext::background();
    outer
      .request(&ctx, Connection::new("c1", "svc"))
      .await
      .unwrap();
    assert_eq!(
      *log.lock().unwrap(),
      vec!["request:first", "request:inner", "request:last"]
    );
  }

  #[tokio::test]
  async fn invalid_connection_is_rejected_before_any_element() {
    let failing = Arc::new(Failing::new());
    let chain = Chain::builder(Role::Client)
      .with_arc(failing.clone())
      .build();
    let err = chain
      .request(&RequestContext::background(), Connection::new("c1", ""))
      .await
      .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(failing.requests.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn rollback_failure_keeps_primary_error() {
    let primary = ChainError::validation("primary");
    let err = primary.with_rollback(Err(ChainError::validation("rollback")));
    assert!(matches!(err.primary(), ChainError::Validation(r) if r == "primary"));
    assert!(matches!(err.rollback_error(), Some(ChainError::Validation(r)) if r == "rollback"));
    let untouched = ChainError::validation("primary").with_rollback(Ok(()));
    assert!(untouched.rollback_error().is_none());
  }
}
