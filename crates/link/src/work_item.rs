// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cancelable, promise-bearing units of work.
//!
//! A [`WorkItem`] couples an input payload with a cancellation signal and a
//! completion slot that is settable exactly once. The party that created
//! the item holds the matching [`PromiseFuture`]; whoever processes the
//! item settles the slot. First writer wins — later settles are no-ops.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::LinkError;

/// Create a completion slot and the future observing it.
pub fn promise<T>() -> (Completion<T>, PromiseFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx: Mutex::new(Some(tx)) }, PromiseFuture { rx })
}

/// Write end of a promise. Settling is atomic and idempotent.
pub struct Completion<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T, LinkError>>>>,
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish()
    }
}

impl<T> Completion<T> {
    /// Settle with a value. Returns false if already settled.
    pub fn succeed(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns false if already settled.
    pub fn fail(&self, error: LinkError) -> bool {
        self.settle(Err(error))
    }

    /// Settle as canceled. Returns false if already settled.
    pub fn cancel(&self) -> bool {
        self.settle(Err(LinkError::Canceled))
    }

    pub fn is_settled(&self) -> bool {
        self.tx.lock().is_none()
    }

    fn settle(&self, outcome: Result<T, LinkError>) -> bool {
        match self.tx.lock().take() {
            // The receiver may already be dropped; the settle still counts.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

/// Read end of a promise.
///
/// Resolves with the settled outcome. If the completion slot is dropped
/// without being settled, resolves as [`LinkError::Disposed`].
pub struct PromiseFuture<T> {
    rx: oneshot::Receiver<Result<T, LinkError>>,
}

impl<T> Future for PromiseFuture<T> {
    type Output = Result<T, LinkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(LinkError::Disposed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A queued unit of work: payload, cancellation, completion slot.
pub struct WorkItem<P, T = ()> {
    payload: P,
    cancellation: CancellationToken,
    completion: Completion<T>,
    /// Disarm signal for an auto-cancellation watcher, if one is armed.
    watch_guard: Mutex<CancellationToken>,
}

impl<P, T> std::fmt::Debug for WorkItem<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem").finish()
    }
}

impl<P, T> WorkItem<P, T> {
    /// Create an item and the future its submitter awaits.
    pub fn new(payload: P, cancellation: CancellationToken) -> (Arc<Self>, PromiseFuture<T>) {
        let (completion, future) = promise();
        let item = Arc::new(Self {
            payload,
            cancellation,
            completion,
            watch_guard: Mutex::new(CancellationToken::new()),
        });
        (item, future)
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn completion(&self) -> &Completion<T> {
        &self.completion
    }

    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Replace the watcher disarm token, retiring any previous watcher.
    /// Returns the token the new watcher should select on.
    pub(crate) fn arm_guard(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut guard = self.watch_guard.lock();
        guard.cancel();
        *guard = token.clone();
        token
    }

    /// Retire the current watcher, if any.
    pub(crate) fn disarm_guard(&self) {
        self.watch_guard.lock().cancel();
    }
}

#[cfg(test)]
#[path = "work_item_tests.rs"]
mod tests;
