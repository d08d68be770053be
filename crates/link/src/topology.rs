// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topology declaration and re-declaration.
//!
//! A topology component declares exchanges, queues and bindings through a
//! configuration callback. In Persistent mode the callback re-runs on
//! every channel activation (declares are idempotent by AMQP); in Once
//! mode it runs to one success or one definitive broker reject, then the
//! runner disposes itself.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelContext, ChannelHandler, ChannelSupervisor};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::id::correlation_id;
use crate::transport::{
    Arguments, ExchangeKind, ExchangeSpec, QueueOk, QueueSpec, TransportChannel,
};
use crate::work_item::{promise, Completion, PromiseFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyMode {
    /// Declare exactly once, then self-dispose.
    Once,
    /// Re-declare on every channel activation until disposed.
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    NotConfigured,
    Configured,
    Disposed,
}

/// Declarative operations available to a configuration callback.
///
/// Every call is a synchronous model RPC executed serially on the
/// channel's loop. Cheap to clone; a clone is only valid for the channel
/// generation it was handed out with.
#[derive(Clone)]
pub struct TopologyOps {
    model: Arc<dyn TransportChannel>,
}

impl TopologyOps {
    pub(crate) fn new(model: Arc<dyn TransportChannel>) -> Self {
        Self { model }
    }

    pub async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), LinkError> {
        let spec =
            ExchangeSpec { name: name.to_owned(), kind, durable, auto_delete };
        self.model.exchange_declare(&spec).await.map_err(LinkError::from)
    }

    pub async fn exchange_declare_passive(&self, name: &str) -> Result<(), LinkError> {
        self.model.exchange_declare_passive(name).await.map_err(LinkError::from)
    }

    pub async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), LinkError> {
        self.model.exchange_delete(name, if_unused).await.map_err(LinkError::from)
    }

    pub async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueOk, LinkError> {
        self.model.queue_declare(spec).await.map_err(LinkError::from)
    }

    /// Durable, non-exclusive queue with default arguments.
    pub async fn queue_declare_durable(&self, name: &str) -> Result<QueueOk, LinkError> {
        self.queue_declare(&QueueSpec {
            name: name.to_owned(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::new(),
        })
        .await
    }

    /// Exclusive auto-delete queue with the given name.
    pub async fn queue_declare_exclusive(&self, name: &str) -> Result<QueueOk, LinkError> {
        self.queue_declare(&QueueSpec {
            name: name.to_owned(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            arguments: Arguments::new(),
        })
        .await
    }

    /// Exclusive auto-delete queue named by the broker.
    pub async fn queue_declare_exclusive_by_server(&self) -> Result<QueueOk, LinkError> {
        self.queue_declare_exclusive("").await
    }

    pub async fn queue_declare_passive(&self, name: &str) -> Result<QueueOk, LinkError> {
        self.model.queue_declare_passive(name).await.map_err(LinkError::from)
    }

    pub async fn queue_delete(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, LinkError> {
        self.model.queue_delete(name, if_unused, if_empty).await.map_err(LinkError::from)
    }

    pub async fn queue_purge(&self, name: &str) -> Result<u32, LinkError> {
        self.model.queue_purge(name).await.map_err(LinkError::from)
    }

    pub async fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LinkError> {
        self.bind_with_arguments(queue, exchange, routing_key, &Arguments::new()).await
    }

    pub async fn bind_with_arguments(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), LinkError> {
        self.model
            .queue_bind(queue, exchange, routing_key, arguments)
            .await
            .map_err(LinkError::from)
    }

    pub async fn unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), LinkError> {
        self.model
            .queue_unbind(queue, exchange, routing_key, &Arguments::new())
            .await
            .map_err(LinkError::from)
    }
}

/// Configuration callback: declares the topology against [`TopologyOps`].
pub type ConfigureFn =
    Arc<dyn Fn(TopologyOps) -> BoxFuture<'static, Result<(), LinkError>> + Send + Sync>;

/// Box a plain async closure into a [`ConfigureFn`].
pub fn configure_fn<F, Fut>(configure: F) -> ConfigureFn
where
    F: Fn(TopologyOps) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), LinkError>> + Send + 'static,
{
    Arc::new(move |ops| {
        let future: BoxFuture<'static, Result<(), LinkError>> = Box::pin(configure(ops));
        future
    })
}

/// Fired after every successful declaration pass.
pub type ReadyFn = Arc<dyn Fn() + Send + Sync>;

/// Fired on every failed declaration pass.
pub type ErrorFn = Arc<dyn Fn(&LinkError) + Send + Sync>;

pub(crate) struct TopologyRunner {
    id: String,
    config: Arc<LinkConfig>,
    mode: TopologyMode,
    configure: ConfigureFn,
    ready: Option<ReadyFn>,
    error: Option<ErrorFn>,
    state: Mutex<TopologyState>,
    waiter: Completion<()>,
    /// Fired when the runner wants its owning handle to dispose it.
    dispose_request: CancellationToken,
}

impl TopologyRunner {
    fn new(
        config: Arc<LinkConfig>,
        mode: TopologyMode,
        configure: ConfigureFn,
        ready: Option<ReadyFn>,
        error: Option<ErrorFn>,
        waiter: Completion<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: correlation_id("topo"),
            config,
            mode,
            configure,
            ready,
            error,
            state: Mutex::new(TopologyState::NotConfigured),
            waiter,
            dispose_request: CancellationToken::new(),
        })
    }

    fn state(&self) -> TopologyState {
        *self.state.lock()
    }

    fn mark_configured(&self) {
        let mut state = self.state.lock();
        if *state != TopologyState::Disposed {
            *state = TopologyState::Configured;
        }
    }

    fn configured_pass(&self) {
        self.mark_configured();
        if let Some(ready) = &self.ready {
            ready();
        }
        self.waiter.succeed(());
    }

    fn failed_pass(&self, error: &LinkError) {
        tracing::warn!(topo_id = %self.id, err = %error, "topology declaration failed");
        if let Some(hook) = &self.error {
            hook(error);
        }
    }
}

#[async_trait]
impl ChannelHandler for TopologyRunner {
    async fn on_active(
        &self,
        ctx: ChannelContext,
        active: CancellationToken,
    ) -> Result<(), LinkError> {
        if self.state() == TopologyState::Disposed {
            return Ok(());
        }
        if self.mode == TopologyMode::Once && self.state() == TopologyState::Configured {
            // A reopen raced the self-dispose; nothing left to declare.
            return Ok(());
        }
        let ops = TopologyOps::new(Arc::clone(&ctx.model));
        loop {
            if active.is_cancelled() {
                return Ok(());
            }
            match (self.configure)(ops.clone()).await {
                Ok(()) => {
                    tracing::debug!(
                        topo_id = %self.id,
                        generation = ctx.generation,
                        "topology configured"
                    );
                    self.configured_pass();
                    if self.mode == TopologyMode::Once {
                        self.dispose_request.cancel();
                    }
                    return Ok(());
                }
                Err(error @ LinkError::Rejected { .. }) if self.mode == TopologyMode::Once => {
                    // Definitive refusal: fail the waiter, give up.
                    self.failed_pass(&error);
                    self.waiter.fail(error);
                    self.dispose_request.cancel();
                    return Ok(());
                }
                Err(error) => {
                    self.failed_pass(&error);
                    if !ctx.model.is_open() {
                        // Channel is gone; let the reopen drive the retry.
                        return Err(error);
                    }
                    tokio::select! {
                        _ = active.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.config.topology_recovery_interval) => {}
                    }
                }
            }
        }
    }

    fn on_disposed(&self) {
        *self.state.lock() = TopologyState::Disposed;
        self.waiter.fail(LinkError::Disposed);
    }
}

/// Disposable handle over a configured topology component.
pub struct Topology {
    runner: Arc<TopologyRunner>,
    channel: Arc<ChannelSupervisor>,
    waiter: Mutex<Option<PromiseFuture<()>>>,
}

impl Topology {
    pub(crate) fn start(
        config: Arc<LinkConfig>,
        channel_factory: impl FnOnce(Arc<TopologyRunner>) -> Arc<ChannelSupervisor>,
        mode: TopologyMode,
        configure: ConfigureFn,
        ready: Option<ReadyFn>,
        error: Option<ErrorFn>,
    ) -> Self {
        let (completion, future) = promise();
        let runner = TopologyRunner::new(config, mode, configure, ready, error, completion);
        let channel = channel_factory(Arc::clone(&runner));

        // Once-mode self-disposal: the runner cannot own the supervisor
        // (the supervisor owns the runner as its handler), so it signals
        // the handle's watcher instead.
        tokio::spawn({
            let request = runner.dispose_request.clone();
            let channel = Arc::clone(&channel);
            async move {
                tokio::select! {
                    _ = request.cancelled() => channel.dispose().await,
                    _ = channel.dispose_token().cancelled() => {}
                }
            }
        });

        Self { runner, channel, waiter: Mutex::new(Some(future)) }
    }

    pub fn state(&self) -> TopologyState {
        self.runner.state()
    }

    /// Wait for the first successful declaration pass.
    ///
    /// For Once topologies a definitive broker reject fails the wait with
    /// that error; cancellation disposes the runner (the declaration will
    /// not be retried) and fails with Canceled.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), LinkError> {
        let future = self.waiter.lock().take();
        let Some(future) = future else {
            return match self.state() {
                TopologyState::Configured => Ok(()),
                TopologyState::Disposed => Err(LinkError::Disposed),
                TopologyState::NotConfigured => Err(LinkError::NotConnected),
            };
        };
        tokio::select! {
            outcome = future => outcome,
            _ = cancel.cancelled() => {
                if self.runner.mode == TopologyMode::Once {
                    self.dispose().await;
                }
                Err(LinkError::Canceled)
            }
        }
    }

    pub async fn dispose(&self) {
        self.channel.dispose().await;
    }
}

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;
