// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::{Future, FutureExt};
use tokio::time::Instant;

use crate::util::cancellation::CancellationListener;

mod bounded;
pub use bounded::{Bounded, Interrupted};

pub trait FutureExtExt: FutureExt {
  /// Polls the future until it completes, `cancellation` fires, or `deadline` passes
  ///
  /// Cancellation is checked before the task on every poll, so a task which becomes ready at the
  /// same moment its request is cancelled still reports [Interrupted::Cancelled].
  fn bounded(self, cancellation: &CancellationListener, deadline: Option<Instant>) -> Bounded<Self>
  where
    Self: Sized,
  {
    Bounded::new(self, cancellation, deadline)
  }
}

impl<Fut: ?Sized + Future> FutureExtExt for Fut {}
