// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unbounded FIFO queues of [`WorkItem`]s, plus a fair multi-queue union.
//!
//! `take` suspends until an item is ready or the caller's cancellation
//! fires. Items whose own cancellation already fired are settled Canceled
//! and skipped. Closing a queue drains it, fails every queued item and
//! makes later puts fail the same way.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::LinkError;
use crate::work_item::WorkItem;

struct Inner<P, T> {
    items: VecDeque<Arc<WorkItem<P, T>>>,
    closed: Option<LinkError>,
}

/// Unbounded FIFO of work items.
pub struct WorkQueue<P, T = ()> {
    inner: Mutex<Inner<P, T>>,
    ready: Notify,
    vacancy: Notify,
}

impl<P, T> Default for WorkQueue<P, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P, T> WorkQueue<P, T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { items: VecDeque::new(), closed: None }),
            ready: Notify::new(),
            vacancy: Notify::new(),
        }
    }

    /// Append an item. If the queue is closed, the item is failed with the
    /// closing error instead; returns whether the item was enqueued.
    pub fn put(&self, item: Arc<WorkItem<P, T>>) -> bool {
        self.insert(item, false)
    }

    /// Insert an item at the head (retry path).
    pub fn put_front(&self, item: Arc<WorkItem<P, T>>) -> bool {
        self.insert(item, true)
    }

    fn insert(&self, item: Arc<WorkItem<P, T>>, front: bool) -> bool {
        let rejected = {
            let mut inner = self.inner.lock();
            match &inner.closed {
                Some(error) => Some(error.clone()),
                None => {
                    if front {
                        inner.items.push_front(item.clone());
                    } else {
                        inner.items.push_back(item.clone());
                    }
                    None
                }
            }
        };
        match rejected {
            Some(error) => {
                item.disarm_guard();
                item.completion().fail(error);
                false
            }
            None => {
                self.ready.notify_waiters();
                true
            }
        }
    }

    /// Pop the first non-canceled item, settling and dropping canceled ones.
    pub fn try_take(&self) -> Option<Arc<WorkItem<P, T>>> {
        let (taken, reaped) = {
            let mut inner = self.inner.lock();
            let mut reaped: Vec<Arc<WorkItem<P, T>>> = Vec::new();
            loop {
                match inner.items.pop_front() {
                    Some(item) if item.is_canceled() => reaped.push(item),
                    Some(item) => break (Some(item), reaped),
                    None => break (None, reaped),
                }
            }
        };
        for item in reaped {
            item.disarm_guard();
            item.completion().cancel();
        }
        if let Some(item) = &taken {
            // Once out of the queue the item belongs to its taker; any
            // auto-cancellation watcher must stand down first.
            item.disarm_guard();
            self.vacancy.notify_waiters();
        }
        taken
    }

    /// Take the next item, suspending until one is ready.
    ///
    /// Fails with [`LinkError::Canceled`] when `cancel` fires first, or
    /// with the closing error once the queue is closed and drained.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Arc<WorkItem<P, T>>, LinkError> {
        loop {
            // Enable the waiter before checking, so a put that lands in
            // between still wakes us.
            let ready = self.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();
            if let Some(item) = self.try_take() {
                return Ok(item);
            }
            if let Some(error) = self.closed_error() {
                return Err(error);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LinkError::Canceled),
                _ = &mut ready => {}
            }
        }
    }

    /// Remove a specific queued item. Returns whether it was still queued.
    pub fn remove(&self, item: &Arc<WorkItem<P, T>>) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.items.iter().position(|queued| Arc::ptr_eq(queued, item)) {
                Some(pos) => {
                    inner.items.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.vacancy.notify_waiters();
        }
        removed
    }

    /// Drain the queue, failing every queued item with `error`, and make
    /// all later puts fail the same way.
    pub fn close(&self, error: LinkError) {
        let drained: Vec<Arc<WorkItem<P, T>>> = {
            let mut inner = self.inner.lock();
            inner.closed = Some(error.clone());
            inner.items.drain(..).collect()
        };
        for item in drained {
            item.disarm_guard();
            item.completion().fail(error.clone());
        }
        self.ready.notify_waiters();
        self.vacancy.notify_waiters();
    }

    pub fn closed_error(&self) -> Option<LinkError> {
        self.inner.lock().closed.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Readiness signal for composite takes; fires on every put.
    pub(crate) fn ready_notified(&self) -> Notified<'_> {
        self.ready.notified()
    }

    /// Vacancy signal for backpressure waits; fires on every take/remove.
    pub(crate) fn vacancy_notified(&self) -> Notified<'_> {
        self.vacancy.notified()
    }
}

/// Fair union over several child queues.
///
/// `take` polls the children round-robin from a rotating start index, so no
/// child starves while another stays busy.
pub struct CompositeWorkQueue<P, T = ()> {
    queues: Vec<Arc<WorkQueue<P, T>>>,
    next: AtomicUsize,
}

impl<P, T> CompositeWorkQueue<P, T> {
    pub fn new(queues: Vec<Arc<WorkQueue<P, T>>>) -> Self {
        Self { queues, next: AtomicUsize::new(0) }
    }

    pub fn try_take(&self) -> Option<Arc<WorkItem<P, T>>> {
        let n = self.queues.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        (0..n).find_map(|i| self.queues[(start + i) % n].try_take())
    }

    /// Take the earliest ready item across all children.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Arc<WorkItem<P, T>>, LinkError> {
        if self.queues.is_empty() {
            cancel.cancelled().await;
            return Err(LinkError::Canceled);
        }
        loop {
            let mut ready: Vec<_> =
                self.queues.iter().map(|q| Box::pin(q.ready_notified())).collect();
            for notified in ready.iter_mut() {
                notified.as_mut().enable();
            }
            if let Some(item) = self.try_take() {
                return Ok(item);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LinkError::Canceled),
                _ = futures_util::future::select_all(ready) => {}
            }
        }
    }
}

#[cfg(test)]
#[path = "work_queue_tests.rs"]
mod tests;
