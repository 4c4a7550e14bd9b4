// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
///
/// Chain elements and drivers observe a request's cancellation through this type, but only the
/// owner of the request (whoever built the [RequestContext](crate::common::context::RequestContext))
/// may cancel it. Child tokens can be produced, allowing sub-cancellation.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  /// A listener whose token nobody else holds, and which therefore never fires
  pub fn detached() -> Self {
    Self {
      token: CancellationToken::new(),
    }
  }

  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

#[cfg(test)]
mod tests {
  use super::CancellationListener;
  use tokio_util::sync::CancellationToken;

  #[test]
  fn listener_follows_owner() {
    let owner = CancellationToken::new();
    let listener = CancellationListener::from(owner.clone());
    let child = listener.child_token();
    assert!(!listener.is_cancelled());
    owner.cancel();
    assert!(listener.is_cancelled());
    assert!(child.is_cancelled());
  }

  #[test]
  fn detached_listener_is_independent() {
    let owner = CancellationToken::new();
    let _listener = CancellationListener::from(owner.clone());
    let detached = CancellationListener::detached();
    owner.cancel();
    assert!(!detached.is_cancelled());
  }
}
