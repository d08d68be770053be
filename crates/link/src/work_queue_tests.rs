// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::*;
use crate::error::LinkError;
use crate::work_item::WorkItem;

fn item(n: u32) -> (Arc<WorkItem<u32>>, crate::work_item::PromiseFuture<()>) {
    WorkItem::new(n, CancellationToken::new())
}

// ── WorkQueue ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn take_is_fifo() {
    let queue: WorkQueue<u32> = WorkQueue::new();
    let cancel = CancellationToken::new();
    for n in 0..3 {
        let (i, _f) = item(n);
        queue.put(i);
    }
    for n in 0..3 {
        let taken = queue.take(&cancel).await.unwrap();
        assert_eq!(*taken.payload(), n);
    }
    assert!(queue.is_empty());
}

#[tokio::test]
async fn take_suspends_until_put() {
    let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        async move { queue.take(&cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    let (i, _f) = item(9);
    queue.put(i);
    let taken = waiter.await.unwrap().unwrap();
    assert_eq!(*taken.payload(), 9);
}

#[tokio::test]
async fn take_fails_canceled_when_cancel_fires() {
    let queue: WorkQueue<u32> = WorkQueue::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_eq!(queue.take(&cancel).await.unwrap_err(), LinkError::Canceled);
}

#[tokio::test]
async fn canceled_items_are_skipped_and_settled() {
    let queue: WorkQueue<u32> = WorkQueue::new();
    let cancel = CancellationToken::new();

    let user = CancellationToken::new();
    let (skipped, skipped_future) = WorkItem::new(1, user.clone());
    queue.put(skipped);
    let (kept, _kept_future) = item(2);
    queue.put(kept);

    user.cancel();
    let taken = queue.take(&cancel).await.unwrap();
    assert_eq!(*taken.payload(), 2);
    assert_eq!(skipped_future.await.unwrap_err(), LinkError::Canceled);
}

#[tokio::test]
async fn put_front_goes_first() {
    let queue: WorkQueue<u32> = WorkQueue::new();
    let cancel = CancellationToken::new();
    let (a, _fa) = item(1);
    queue.put(a);
    let (b, _fb) = item(2);
    queue.put_front(b);
    assert_eq!(*queue.take(&cancel).await.unwrap().payload(), 2);
    assert_eq!(*queue.take(&cancel).await.unwrap().payload(), 1);
}

#[tokio::test]
async fn close_fails_queued_and_future_puts() {
    let queue: WorkQueue<u32> = WorkQueue::new();
    let (queued, queued_future) = item(1);
    queue.put(queued);

    queue.close(LinkError::Disposed);
    assert_eq!(queued_future.await.unwrap_err(), LinkError::Disposed);

    let (late, late_future) = item(2);
    assert!(!queue.put(late));
    assert_eq!(late_future.await.unwrap_err(), LinkError::Disposed);

    let cancel = CancellationToken::new();
    assert_eq!(queue.take(&cancel).await.unwrap_err(), LinkError::Disposed);
}

#[tokio::test]
async fn remove_unqueues_a_specific_item() {
    let queue: WorkQueue<u32> = WorkQueue::new();
    let (a, _fa) = item(1);
    let (b, _fb) = item(2);
    queue.put(Arc::clone(&a));
    queue.put(b);
    assert!(queue.remove(&a));
    assert!(!queue.remove(&a));
    assert_eq!(queue.len(), 1);
}

// ── CompositeWorkQueue ────────────────────────────────────────────────────

#[tokio::test]
async fn composite_drains_all_children() {
    let first: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
    let second: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
    let composite = CompositeWorkQueue::new(vec![Arc::clone(&first), Arc::clone(&second)]);
    let cancel = CancellationToken::new();

    let mut futures = Vec::new();
    for n in 0..4 {
        let (i, f) = item(n);
        futures.push(f);
        if n % 2 == 0 {
            first.put(i);
        } else {
            second.put(i);
        }
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(*composite.take(&cancel).await.unwrap().payload());
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn composite_rotation_is_fair() {
    let first: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
    let second: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
    let composite = CompositeWorkQueue::new(vec![Arc::clone(&first), Arc::clone(&second)]);
    let cancel = CancellationToken::new();

    // Keep the first child saturated; the second must still be served
    // within two takes.
    for n in 0..8 {
        let (i, _f) = item(n);
        first.put(i);
    }
    let (starved, _f) = item(100);
    second.put(starved);

    let a = *composite.take(&cancel).await.unwrap().payload();
    let b = *composite.take(&cancel).await.unwrap().payload();
    assert!(a == 100 || b == 100, "rotation never reached the second child");
}

#[tokio::test]
async fn composite_wakes_on_late_put() {
    let first: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
    let second: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
    let composite =
        Arc::new(CompositeWorkQueue::new(vec![Arc::clone(&first), Arc::clone(&second)]));
    let cancel = CancellationToken::new();

    let waiter = tokio::spawn({
        let composite = Arc::clone(&composite);
        let cancel = cancel.clone();
        async move { composite.take(&cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let (i, _f) = item(42);
    second.put(i);
    assert_eq!(*waiter.await.unwrap().unwrap().payload(), 42);
}

// ── property: puts preserve order ─────────────────────────────────────────

#[test]
fn fifo_order_is_preserved_for_any_batch() {
    proptest::proptest!(|(values in proptest::collection::vec(0u32..1000, 0..64))| {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let drained = runtime.block_on(async {
            let queue: WorkQueue<u32> = WorkQueue::new();
            for value in &values {
                let (i, _f) = item(*value);
                queue.put(i);
            }
            let mut drained = Vec::new();
            while let Some(taken) = queue.try_take() {
                drained.push(*taken.payload());
            }
            drained
        });
        proptest::prop_assert_eq!(drained, values);
    });
}
