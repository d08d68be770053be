// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel supervisor: owns one AMQP channel (model) on a connection.
//!
//! Runs its own loop task keyed by [`ChannelState`]:
//!
//! ```text
//! Init -> Open -> Active -> Stop -> Reopen -> Active -> ... -> Disposed
//! ```
//!
//! Each activation hands a fresh model to the attached [`ChannelHandler`]
//! under a new generation number. Broker notices (acks, nacks, returns)
//! observed between `on_active` start and the active token firing always
//! belong to that activation's model — the notice stream is per-model.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::connection::{ConnectionState, ConnectionSupervisor};
use crate::error::LinkError;
use crate::id::correlation_id;
use crate::transport::{ChannelNotice, ReturnedPublish, ShutdownInitiator, TransportChannel};
use crate::work_item::{promise, Completion, PromiseFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Open,
    Reopen,
    Active,
    Stop,
    Disposed,
}

/// What an activation hands to the handler.
#[derive(Clone)]
pub struct ChannelContext {
    pub model: Arc<dyn TransportChannel>,
    pub generation: u64,
}

/// Capability interface a channel-owning component implements.
///
/// `on_connecting` runs concurrently with model creation and is canceled
/// once the attempt is decided. `on_active` runs against the live model;
/// when it returns Ok the channel stays active until the connection drops,
/// the model shuts down or the supervisor is disposed. Returning Err sends
/// the channel straight to Stop (and Reopen).
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn on_connecting(&self, _cancel: CancellationToken) {}

    async fn on_active(
        &self,
        ctx: ChannelContext,
        active: CancellationToken,
    ) -> Result<(), LinkError>;

    fn on_ack(&self, _delivery_tag: u64, _multiple: bool) {}

    fn on_nack(&self, _delivery_tag: u64, _multiple: bool) {}

    fn on_return(&self, _returned: ReturnedPublish) {}

    fn on_disposed(&self) {}
}

struct Action {
    cancel: CancellationToken,
    run: Box<dyn FnOnce(Arc<dyn TransportChannel>) -> BoxFuture<'static, ()> + Send>,
    abort: Box<dyn FnOnce(LinkError) + Send>,
}

pub struct ChannelSupervisor {
    id: String,
    config: Arc<LinkConfig>,
    connection: Arc<ConnectionSupervisor>,
    handler: Arc<dyn ChannelHandler>,
    dispose: CancellationToken,
    generation: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
    actions_tx: mpsc::UnboundedSender<Action>,
}

impl ChannelSupervisor {
    /// Create the supervisor and start its loop task.
    pub fn spawn(
        config: Arc<LinkConfig>,
        connection: Arc<ConnectionSupervisor>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Init);
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            id: correlation_id("chan"),
            config,
            connection,
            handler,
            dispose: CancellationToken::new(),
            generation: AtomicU64::new(0),
            state_tx,
            actions_tx,
        });
        tokio::spawn(run_loop(Arc::clone(&this), actions_rx));
        this
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Generation of the current (or most recent) activation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn dispose_token(&self) -> &CancellationToken {
        &self.dispose
    }

    /// Post a model action onto the channel's serial action loop.
    ///
    /// Actions run one at a time, interleaved with notice forwarding. Only
    /// valid while the channel is Active: posts in any other state fail
    /// NotConnected immediately.
    pub fn invoke<T, F, Fut>(&self, cancel: &CancellationToken, action: F) -> PromiseFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn TransportChannel>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        let (completion, future) = promise();
        let completion = Arc::new(completion);
        if self.state() != ChannelState::Active {
            completion.fail(LinkError::NotConnected);
            return future;
        }
        let run = {
            let completion = Arc::clone(&completion);
            Box::new(move |model: Arc<dyn TransportChannel>| -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    settle(&completion, action(model).await);
                })
            })
        };
        let abort = {
            let completion = Arc::clone(&completion);
            Box::new(move |error: LinkError| {
                completion.fail(error);
            })
        };
        let action = Action { cancel: cancel.clone(), run, abort };
        if self.actions_tx.send(action).is_err() {
            completion.fail(LinkError::Disposed);
        }
        future
    }

    /// Dispose the supervisor and wait until its loop reaches Disposed.
    pub async fn dispose(&self) {
        self.dispose.cancel();
        let mut state = self.state_tx.subscribe();
        loop {
            if *state.borrow_and_update() == ChannelState::Disposed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
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

async fn run_loop(this: Arc<ChannelSupervisor>, mut actions_rx: mpsc::UnboundedReceiver<Action>) {
    let mut state = ChannelState::Init;
    let mut model: Option<Arc<dyn TransportChannel>> = None;
    let mut notices: Option<mpsc::UnboundedReceiver<ChannelNotice>> = None;
    let mut conn_state = this.connection.watch_state();

    loop {
        this.state_tx.send_replace(state);
        match state {
            ChannelState::Init => {
                state = ChannelState::Open;
            }
            ChannelState::Open | ChannelState::Reopen => {
                if this.dispose.is_cancelled() {
                    state = ChannelState::Disposed;
                    continue;
                }
                // Back off only when the connection itself looks healthy;
                // otherwise the connection wait below is the backoff.
                if state == ChannelState::Reopen
                    && this.connection.state() == ConnectionState::Open
                    && !this.config.channel_recovery_interval.is_zero()
                {
                    tokio::select! {
                        _ = this.dispose.cancelled() => {
                            state = ChannelState::Disposed;
                            continue;
                        }
                        _ = tokio::time::sleep(this.config.channel_recovery_interval) => {}
                    }
                }
                if wait_connection_open(&this, &mut conn_state).await.is_err() {
                    state = ChannelState::Disposed;
                    continue;
                }

                let connecting = CancellationToken::new();
                let connecting_task = tokio::spawn({
                    let handler = Arc::clone(&this.handler);
                    let token = connecting.clone();
                    async move { handler.on_connecting(token).await }
                });
                let created = tokio::select! {
                    _ = this.dispose.cancelled() => Err(LinkError::Disposed),
                    created = this.connection.create_channel(&this.dispose) => created,
                };
                connecting.cancel();
                let _ = connecting_task.await;

                match created {
                    Ok(fresh) => {
                        notices = fresh.take_notices();
                        model = Some(fresh);
                        let generation = this.generation.fetch_add(1, Ordering::AcqRel) + 1;
                        tracing::debug!(chan_id = %this.id, generation, "channel open");
                        state = ChannelState::Active;
                    }
                    Err(LinkError::Disposed) => {
                        state = ChannelState::Disposed;
                    }
                    Err(error) => {
                        tracing::debug!(chan_id = %this.id, err = %error, "channel open failed");
                        state = ChannelState::Stop;
                    }
                }
            }
            ChannelState::Active => {
                state = match &model {
                    Some(active_model) => {
                        run_active(
                            &this,
                            Arc::clone(active_model),
                            &mut notices,
                            &mut actions_rx,
                            &mut conn_state,
                        )
                        .await
                    }
                    None => ChannelState::Stop,
                };
            }
            ChannelState::Stop => {
                notices = None;
                if let Some(dead) = model.take() {
                    if let Err(error) = dead.close().await {
                        // I/O faults while closing a dying model are expected.
                        tracing::debug!(chan_id = %this.id, err = %error, "model close failed");
                    }
                }
                state = if this.dispose.is_cancelled() {
                    ChannelState::Disposed
                } else {
                    ChannelState::Reopen
                };
            }
            ChannelState::Disposed => {
                actions_rx.close();
                while let Ok(action) = actions_rx.try_recv() {
                    (action.abort)(LinkError::Disposed);
                }
                this.handler.on_disposed();
                tracing::debug!(chan_id = %this.id, "channel supervisor disposed");
                return;
            }
        }
    }
}

/// Wait until the connection is Open. Err means the channel must die
/// (supervisor disposed or connection terminally gone).
async fn wait_connection_open(
    this: &Arc<ChannelSupervisor>,
    conn_state: &mut watch::Receiver<ConnectionState>,
) -> Result<(), ()> {
    loop {
        match *conn_state.borrow_and_update() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Disposed => return Err(()),
            ConnectionState::Init | ConnectionState::Opening => {}
        }
        tokio::select! {
            _ = this.dispose.cancelled() => return Err(()),
            changed = conn_state.changed() => {
                if changed.is_err() {
                    return Err(());
                }
            }
        }
    }
}

async fn run_active(
    this: &Arc<ChannelSupervisor>,
    model: Arc<dyn TransportChannel>,
    notices: &mut Option<mpsc::UnboundedReceiver<ChannelNotice>>,
    actions_rx: &mut mpsc::UnboundedReceiver<Action>,
    conn_state: &mut watch::Receiver<ConnectionState>,
) -> ChannelState {
    let generation = this.generation();
    let active = CancellationToken::new();
    let ctx = ChannelContext { model: Arc::clone(&model), generation };
    let mut on_active = Box::pin({
        let handler = Arc::clone(&this.handler);
        let token = active.clone();
        async move { handler.on_active(ctx, token).await }
    });
    let mut on_active_done = false;
    tracing::debug!(chan_id = %this.id, generation, "channel active");

    loop {
        tokio::select! {
            _ = this.dispose.cancelled() => break,
            outcome = &mut on_active, if !on_active_done => {
                on_active_done = true;
                if let Err(error) = outcome {
                    tracing::debug!(chan_id = %this.id, err = %error, "channel handler stopped");
                    break;
                }
            }
            changed = conn_state.changed() => {
                if changed.is_err() || *conn_state.borrow() != ConnectionState::Open {
                    tracing::debug!(chan_id = %this.id, "connection lost under channel");
                    break;
                }
            }
            notice = recv_notice(notices) => match notice {
                Some(ChannelNotice::Ack { delivery_tag, multiple }) => {
                    this.handler.on_ack(delivery_tag, multiple);
                }
                Some(ChannelNotice::Nack { delivery_tag, multiple, .. }) => {
                    this.handler.on_nack(delivery_tag, multiple);
                }
                Some(ChannelNotice::Return(returned)) => {
                    this.handler.on_return(returned);
                }
                Some(ChannelNotice::Shutdown(shutdown)) => {
                    if shutdown.initiator != ShutdownInitiator::Application {
                        tracing::warn!(
                            chan_id = %this.id,
                            initiator = ?shutdown.initiator,
                            code = shutdown.code,
                            reason = %shutdown.reason,
                            "model shut down"
                        );
                    }
                    break;
                }
                None => break,
            },
            action = actions_rx.recv() => {
                if let Some(action) = action {
                    if action.cancel.is_cancelled() {
                        (action.abort)(LinkError::Canceled);
                    } else {
                        (action.run)(Arc::clone(&model)).await;
                    }
                }
            }
        }
    }

    active.cancel();
    if !on_active_done {
        // Let the handler unwind cooperatively (restage pending work etc.).
        let _ = on_active.await;
    }
    ChannelState::Stop
}

async fn recv_notice(
    notices: &mut Option<mpsc::UnboundedReceiver<ChannelNotice>>,
) -> Option<ChannelNotice> {
    match notices {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
