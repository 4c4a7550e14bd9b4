// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  pin::Pin,
  task::{Context, Poll},
};

use futures::{future::BoxFuture, Future, FutureExt};
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep};

use crate::util::cancellation::CancellationListener;

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Interrupted {
  #[error("Operation cancelled")]
  Cancelled,
  #[error("Operation deadline exceeded")]
  DeadlineExceeded,
}

pin_project! {
  /// Future returned by [FutureExtExt::bounded](super::FutureExtExt::bounded)
  #[must_use = "futures do nothing unless polled"]
  pub struct Bounded<F> {
    #[pin]
    task: F,
    canceller: Option<BoxFuture<'static, ()>>,
    #[pin]
    deadline: Option<Sleep>,
  }
}

impl<F> Bounded<F> {
  pub(super) fn new(task: F, cancellation: &CancellationListener, deadline: Option<Instant>) -> Self {
    let listener = cancellation.clone();
    Self {
      task,
      canceller: Some(async move { listener.cancelled().await }.boxed()),
      deadline: deadline.map(tokio::time::sleep_until),
    }
  }
}

impl<F: Future> Future for Bounded<F> {
  type Output = Result<F::Output, Interrupted>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.project();
    if let Some(canceller) = this.canceller.as_mut() {
      if canceller.poll_unpin(cx).is_ready() {
        *this.canceller = None;
        return Poll::Ready(Err(Interrupted::Cancelled));
      }
    }
    if let Poll::Ready(res) = this.task.poll(cx) {
      return Poll::Ready(Ok(res));
    }
    match this.deadline.as_pin_mut() {
      Some(deadline) => match deadline.poll(cx) {
        Poll::Ready(()) => Poll::Ready(Err(Interrupted::DeadlineExceeded)),
        Poll::Pending => Poll::Pending,
      },
      None => Poll::Pending,
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::time::Instant;
  use tokio_util::sync::CancellationToken;

  use super::Interrupted;
  use crate::{ext::FutureExtExt, util::cancellation::CancellationListener};

  #[tokio::test]
  async fn completes_when_unbounded() {
    let listener = CancellationListener::detached();
    let res = async { 7 }.bounded(&listener, None).await;
    assert_eq!(res, Ok(7));
  }

  #[tokio::test]
  async fn cancellation_interrupts_pending_task() {
    let token = CancellationToken::new();
    let listener = CancellationListener::from(token.clone());
    let task = futures::future::pending::<()>().bounded(&listener, None);
    token.cancel();
    assert_eq!(task.await, Err(Interrupted::Cancelled));
  }

  #[tokio::test(start_paused = true)]
  async fn deadline_interrupts_pending_task() {
    let listener = CancellationListener::detached();
    let deadline = Instant::now() + Duration::from_millis(50);
    let res = futures::future::pending::<()>()
      .bounded(&listener, Some(deadline))
      .await;
    assert_eq!(res, Err(Interrupted::DeadlineExceeded));
  }
}
