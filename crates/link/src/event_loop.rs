// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A supervisor-private serial executor.
//!
//! Every state transition of a supervisor is posted here as a unit, so all
//! mutation is single-threaded by construction and re-entrant callbacks
//! become ordinary queued messages. Units run strictly FIFO, one at a
//! time; cancellation before start settles the unit's promise Canceled
//! without running it, cancellation after start is cooperative through the
//! token handed to the unit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::LinkError;
use crate::work_item::{promise, Completion, PromiseFuture};

/// How a loop winds down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeMode {
    /// Run every queued unit to completion, then stop.
    Drain,
    /// Finish the in-flight unit; fail queued units with Disposed.
    Wait,
    /// Fail queued units and fire the loop token into the in-flight unit.
    Cancel,
}

struct Job {
    cancel: CancellationToken,
    run: Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>,
    abort: Box<dyn FnOnce(LinkError) + Send>,
}

pub struct EventLoop {
    id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    shutdown: CancellationToken,
    abandon: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new(id: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let abandon = Arc::new(AtomicBool::new(false));
        let worker = tokio::spawn(run_worker(rx, shutdown.clone(), Arc::clone(&abandon)));
        Self {
            id: id.into(),
            tx: Mutex::new(Some(tx)),
            shutdown,
            abandon,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a unit and return the promise of its result.
    ///
    /// The unit receives an effective token that fires when either the
    /// caller's `cancel` or the loop's own Cancel-disposal fires.
    pub fn schedule<T, F, Fut>(&self, cancel: &CancellationToken, unit: F) -> PromiseFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        let (completion, future) = promise();
        let completion = Arc::new(completion);
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            completion.fail(LinkError::Disposed);
            return future;
        };

        let user = cancel.clone();
        let run = {
            let completion = Arc::clone(&completion);
            let user = user.clone();
            Box::new(move |loop_token: CancellationToken| -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    let effective = loop_token.child_token();
                    // Bridge the caller's token into the unit's token.
                    tokio::spawn({
                        let user = user.clone();
                        let effective = effective.clone();
                        async move {
                            tokio::select! {
                                _ = user.cancelled() => effective.cancel(),
                                _ = effective.cancelled() => {}
                            }
                        }
                    });
                    let outcome = unit(effective.clone()).await;
                    effective.cancel();
                    settle(&completion, outcome);
                })
            })
        };
        let abort = {
            let completion = Arc::clone(&completion);
            Box::new(move |error: LinkError| {
                completion.fail(error);
            })
        };

        if tx.send(Job { cancel: user, run, abort }).is_err() {
            completion.fail(LinkError::Disposed);
        }
        future
    }

    /// Stop the loop and wait for its worker to exit.
    pub async fn dispose(&self, mode: DisposeMode) {
        match mode {
            DisposeMode::Drain => {}
            DisposeMode::Wait => self.abandon.store(true, Ordering::Release),
            DisposeMode::Cancel => {
                self.abandon.store(true, Ordering::Release);
                self.shutdown.cancel();
            }
        }
        self.tx.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.await.is_err() {
                tracing::warn!(loop_id = %self.id, "event loop worker aborted");
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

fn settle<T>(completion: &Completion<T>, outcome: Result<T, LinkError>) {
    match outcome {
        Ok(value) => {
            completion.succeed(value);
        }
        Err(error) => {
            completion.fail(error);
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    shutdown: CancellationToken,
    abandon: Arc<AtomicBool>,
) {
    while let Some(job) = rx.recv().await {
        if abandon.load(Ordering::Acquire) {
            (job.abort)(LinkError::Disposed);
            continue;
        }
        if job.cancel.is_cancelled() {
            (job.abort)(LinkError::Canceled);
            continue;
        }
        (job.run)(shutdown.clone()).await;
    }
}

#[cfg(test)]
#[path = "event_loop_tests.rs"]
mod tests;
