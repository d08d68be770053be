// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A work queue whose entries withdraw themselves when canceled.
//!
//! Each `put` arms a watcher: if the item's cancellation fires while the
//! item is still queued, the watcher removes the node and settles the item
//! Canceled. A taken item is disarmed before the consumer sees it, so a
//! race between take and cancel resolves in favor of take.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::LinkError;
use crate::work_item::WorkItem;
use crate::work_queue::WorkQueue;

pub struct AutoCancellingQueue<P, T = ()> {
    queue: Arc<WorkQueue<P, T>>,
}

impl<P, T> Default for AutoCancellingQueue<P, T>
where
    P: Send + Sync + 'static,
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P, T> AutoCancellingQueue<P, T>
where
    P: Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self { queue: Arc::new(WorkQueue::new()) }
    }

    /// Append an item and arm its cancellation watcher.
    pub fn put(&self, item: Arc<WorkItem<P, T>>) {
        if self.queue.put(item.clone()) {
            self.watch(item);
        }
    }

    /// Re-queue a batch at the head, in order, re-arming each watcher.
    ///
    /// Used to hand unfinished work of a dead channel generation back to
    /// the front of the line for the next one.
    pub fn put_retry(&self, items: Vec<Arc<WorkItem<P, T>>>) {
        for item in items.into_iter().rev() {
            if self.queue.put_front(item.clone()) {
                self.watch(item);
            }
        }
    }

    /// Take the next item; the queue disarms its watcher before returning.
    pub async fn take(&self, cancel: &CancellationToken) -> Result<Arc<WorkItem<P, T>>, LinkError> {
        self.queue.take(cancel).await
    }

    /// Suspend while the queue holds `ceiling` or more items.
    pub async fn wait_below(
        &self,
        ceiling: usize,
        cancel: &CancellationToken,
    ) -> Result<(), LinkError> {
        loop {
            let vacancy = self.queue.vacancy_notified();
            tokio::pin!(vacancy);
            vacancy.as_mut().enable();
            if let Some(error) = self.queue.closed_error() {
                return Err(error);
            }
            if self.queue.len() < ceiling {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(LinkError::Canceled),
                _ = &mut vacancy => {}
            }
        }
    }

    pub fn close(&self, error: LinkError) {
        self.queue.close(error);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Shared inner queue, for composing into a [`CompositeWorkQueue`].
    ///
    /// [`CompositeWorkQueue`]: crate::work_queue::CompositeWorkQueue
    pub fn inner(&self) -> Arc<WorkQueue<P, T>> {
        Arc::clone(&self.queue)
    }

    fn watch(&self, item: Arc<WorkItem<P, T>>) {
        let disarm = item.arm_guard();
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::select! {
                _ = disarm.cancelled() => {}
                _ = item.cancellation().cancelled() => {
                    if queue.remove(&item) {
                        item.completion().cancel();
                    }
                }
            }
        });
    }
}

#[cfg(test)]
#[path = "auto_cancel_tests.rs"]
mod tests;
