//! Completion handles
//!
//! Callers never block inside the core: `submit` hands back a
//! [`CompletionHandle`] that resolves exactly once, to an outcome or a typed
//! failure. Cancellation is cooperative and one-shot.

use crate::operation::Outcome;
use crate::{CancellationReason, Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Notify};

/// Cross-task cancellation flag with first-writer-wins semantics.
#[derive(Debug, Default)]
pub struct CancelFlag {
    reason: Mutex<Option<CancellationReason>>,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Arc<CancelFlag> {
        Arc::new(CancelFlag::default())
    }

    /// Request cancellation. The first reason sticks; later calls are no-ops.
    pub fn request(&self, reason: CancellationReason) {
        let mut slot = self.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
            self.notify.notify_one();
        }
    }

    pub fn requested(&self) -> Option<CancellationReason> {
        *self.reason.lock().unwrap()
    }

    /// Wait until cancellation is requested.
    pub async fn cancelled(&self) -> CancellationReason {
        loop {
            if let Some(reason) = self.requested() {
                return reason;
            }
            self.notify.notified().await;
        }
    }
}

/// The caller-facing side of one submitted operation.
///
/// Awaiting the handle yields the operation's result. Dropping it without
/// awaiting is allowed; the operation keeps running until it terminates on
/// its own. [`CompletionHandle::cancel`] stops result delivery immediately.
#[derive(Debug)]
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<Outcome>>,
    flag: Arc<CancelFlag>,
}

impl CompletionHandle {
    pub(crate) fn new() -> (Self, oneshot::Sender<Result<Outcome>>, Arc<CancelFlag>) {
        let (tx, rx) = oneshot::channel();
        let flag = CancelFlag::new();
        (
            Self {
                rx,
                flag: flag.clone(),
            },
            tx,
            flag,
        )
    }

    /// Stop listening for the result. The handle resolves
    /// `Cancelled(StoppedListening)`; bytes already on the wire are not
    /// recalled and any late response is discarded.
    pub fn cancel(&self) {
        self.flag.request(CancellationReason::StoppedListening);
    }
}

impl Future for CompletionHandle {
    type Output = Result<Outcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Internal(
                "operation resolver dropped without resolving".into(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_cancel_reason_wins() {
        let flag = CancelFlag::new();
        flag.request(CancellationReason::TimedOut);
        flag.request(CancellationReason::StoppedListening);
        assert_eq!(flag.requested(), Some(CancellationReason::TimedOut));
        assert_eq!(flag.cancelled().await, CancellationReason::TimedOut);
    }

    #[tokio::test]
    async fn test_handle_resolves_once() {
        let (handle, tx, _flag) = CompletionHandle::new();
        tx.send(Err(Error::DocumentNotFound)).unwrap();
        assert!(matches!(handle.await, Err(Error::DocumentNotFound)));
    }

    #[test]
    fn test_handle_polls_pending_until_resolved() {
        let (handle, tx, _flag) = CompletionHandle::new();
        let mut fut = tokio_test::task::spawn(handle);
        tokio_test::assert_pending!(fut.poll());

        tx.send(Err(Error::DocumentNotFound)).unwrap();
        assert!(matches!(
            tokio_test::assert_ready!(fut.poll()),
            Err(Error::DocumentNotFound)
        ));
    }

    #[tokio::test]
    async fn test_cancel_sets_stopped_listening() {
        let (handle, _tx, flag) = CompletionHandle::new();
        handle.cancel();
        assert_eq!(
            flag.requested(),
            Some(CancellationReason::StoppedListening)
        );
    }
}
