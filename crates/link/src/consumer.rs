// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consuming pipeline: prefetch, delivery queue, single handler invoker.
//!
//! Per activation the core declares its topology (which names the queue),
//! sets `basic.qos`, starts `basic.consume` and pumps deliveries — each
//! stamped with the activation's generation and model — into an internal
//! queue. One long-lived invoker awaits the user handler per delivery and
//! sends at most one outcome to the broker, always on the generation that
//! delivered the message. Stale generations are dropped silently: the
//! broker already requeued them when the channel closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelContext, ChannelHandler, ChannelSupervisor};
use crate::error::{LinkError, TransportError};
use crate::id::correlation_id;
use crate::message::Delivery;
use crate::topology::TopologyOps;
use crate::transport::TransportChannel;

/// What to tell the broker about a handled delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
}

/// User message handler.
///
/// The token fires when the consumer is disposing; a handler parked on an
/// external gate should give up then (its delivery is left unacked for the
/// broker to redeliver).
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        delivery: Delivery,
        cancel: CancellationToken,
    ) -> Result<ConsumeOutcome, LinkError>;
}

/// Topology callback for a consumer; resolves to the queue to consume.
pub type ConsumerTopologyFn =
    Arc<dyn Fn(TopologyOps) -> BoxFuture<'static, Result<String, LinkError>> + Send + Sync>;

/// Box a plain async closure into a [`ConsumerTopologyFn`].
pub fn consumer_topology_fn<F, Fut>(topology: F) -> ConsumerTopologyFn
where
    F: Fn(TopologyOps) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, LinkError>> + Send + 'static,
{
    Arc::new(move |ops| {
        let future: BoxFuture<'static, Result<String, LinkError>> = Box::pin(topology(ops));
        future
    })
}

struct StampedDelivery {
    delivery: Delivery,
    /// Model of the generation that delivered; outcomes go here or nowhere.
    model: Arc<dyn TransportChannel>,
}

pub(crate) struct ConsumerCore {
    id: String,
    prefetch: u16,
    auto_ack: bool,
    requeue_on_error: bool,
    topology: ConsumerTopologyFn,
    handler: Arc<dyn DeliveryHandler>,
    deliveries_tx: mpsc::UnboundedSender<StampedDelivery>,
    dispose: CancellationToken,
    current_generation: AtomicU64,
}

impl ConsumerCore {
    fn new(
        prefetch: u16,
        auto_ack: bool,
        requeue_on_error: bool,
        topology: ConsumerTopologyFn,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Arc<Self> {
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Self {
            id: correlation_id("cons"),
            prefetch,
            auto_ack,
            requeue_on_error,
            topology,
            handler,
            deliveries_tx,
            dispose: CancellationToken::new(),
            current_generation: AtomicU64::new(0),
        });
        tokio::spawn(run_invoker(Arc::clone(&core), deliveries_rx));
        core
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation.load(Ordering::Acquire) == generation
    }
}

#[async_trait]
impl ChannelHandler for ConsumerCore {
    async fn on_active(
        &self,
        ctx: ChannelContext,
        active: CancellationToken,
    ) -> Result<(), LinkError> {
        self.current_generation.store(ctx.generation, Ordering::Release);

        let queue = (self.topology)(TopologyOps::new(Arc::clone(&ctx.model))).await?;
        ctx.model.basic_qos(self.prefetch).await.map_err(LinkError::from)?;
        let mut stream = ctx
            .model
            .basic_consume(&queue, &self.id, self.auto_ack)
            .await
            .map_err(LinkError::from)?;
        tracing::debug!(
            cons_id = %self.id,
            queue = %queue,
            generation = ctx.generation,
            prefetch = self.prefetch,
            "consuming"
        );

        loop {
            tokio::select! {
                _ = active.cancelled() => return Ok(()),
                raw = stream.recv() => {
                    let Some(raw) = raw else {
                        // The consume stream died without a notice.
                        return Err(LinkError::Transport(TransportError::ChannelClosed));
                    };
                    let delivery = Delivery {
                        delivery_tag: raw.delivery_tag,
                        redelivered: raw.redelivered,
                        exchange: raw.exchange,
                        routing_key: raw.routing_key,
                        queue: queue.clone(),
                        properties: raw.properties,
                        body: raw.body,
                        generation: ctx.generation,
                    };
                    let stamped =
                        StampedDelivery { delivery, model: Arc::clone(&ctx.model) };
                    if self.deliveries_tx.send(stamped).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn on_disposed(&self) {
        self.dispose.cancel();
    }
}

async fn run_invoker(core: Arc<ConsumerCore>, mut rx: mpsc::UnboundedReceiver<StampedDelivery>) {
    loop {
        let stamped = tokio::select! {
            _ = core.dispose.cancelled() => break,
            stamped = rx.recv() => match stamped {
                Some(stamped) => stamped,
                None => break,
            },
        };
        if !core.is_current(stamped.delivery.generation) {
            tracing::trace!(
                cons_id = %core.id,
                delivery_tag = stamped.delivery.delivery_tag,
                "dropping delivery from replaced channel"
            );
            continue;
        }

        let delivery_tag = stamped.delivery.delivery_tag;
        let generation = stamped.delivery.generation;
        let handled = tokio::select! {
            // Disposal abandons the in-flight invocation: no outcome is
            // sent and the broker redelivers.
            _ = core.dispose.cancelled() => break,
            handled = core.handler.handle(stamped.delivery, core.dispose.child_token()) => handled,
        };
        let outcome = match handled {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(cons_id = %core.id, err = %error, "delivery handler failed");
                if core.requeue_on_error {
                    ConsumeOutcome::Nack { requeue: true }
                } else {
                    ConsumeOutcome::Reject { requeue: false }
                }
            }
        };

        if core.auto_ack {
            continue;
        }
        if !core.is_current(generation) {
            tracing::trace!(
                cons_id = %core.id,
                delivery_tag,
                "dropping outcome for replaced channel"
            );
            continue;
        }
        let sent = match outcome {
            ConsumeOutcome::Ack => stamped.model.basic_ack(delivery_tag, false).await,
            ConsumeOutcome::Nack { requeue } => {
                stamped.model.basic_nack(delivery_tag, false, requeue).await
            }
            ConsumeOutcome::Reject { requeue } => {
                stamped.model.basic_reject(delivery_tag, requeue).await
            }
        };
        if let Err(error) = sent {
            tracing::debug!(cons_id = %core.id, err = %error, "outcome dispatch failed");
        }
    }
}

/// Disposable consuming handle bound to one channel.
pub struct Consumer {
    core: Arc<ConsumerCore>,
    channel: Arc<ChannelSupervisor>,
}

impl Consumer {
    pub(crate) fn start(
        prefetch: u16,
        auto_ack: bool,
        requeue_on_error: bool,
        topology: ConsumerTopologyFn,
        handler: Arc<dyn DeliveryHandler>,
        channel_factory: impl FnOnce(Arc<ConsumerCore>) -> Arc<ChannelSupervisor>,
    ) -> Self {
        let core = ConsumerCore::new(prefetch, auto_ack, requeue_on_error, topology, handler);
        let channel = channel_factory(Arc::clone(&core));
        Self { core, channel }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub async fn dispose(&self) {
        self.channel.dispose().await;
    }
}

/// Builder for a [`Consumer`]. Obtained from [`Link::consumer`].
///
/// [`Link::consumer`]: crate::link::Link::consumer
pub struct ConsumerBuilder {
    pub(crate) prefetch: u16,
    pub(crate) auto_ack: bool,
    pub(crate) requeue_on_error: bool,
    pub(crate) topology: Option<ConsumerTopologyFn>,
    pub(crate) handler: Option<Arc<dyn DeliveryHandler>>,
    pub(crate) channel_factory: Box<dyn FnOnce(Arc<ConsumerCore>) -> Arc<ChannelSupervisor>>,
}

impl ConsumerBuilder {
    /// Consume from an existing queue without declaring anything.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.topology = Some(consumer_topology_fn(move |_ops| {
            let name = name.clone();
            async move { Ok(name) }
        }));
        self
    }

    /// Declare topology per activation; the callback names the queue.
    pub fn topology<F, Fut>(mut self, topology: F) -> Self
    where
        F: Fn(TopologyOps) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, LinkError>> + Send + 'static,
    {
        self.topology = Some(consumer_topology_fn(topology));
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Whether a handler error nacks with requeue (default) or rejects
    /// without.
    pub fn requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = requeue;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn DeliveryHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<Consumer, LinkError> {
        let topology = self.topology.ok_or_else(|| {
            LinkError::Configuration("consumer needs a queue or a topology callback".to_owned())
        })?;
        let handler = self
            .handler
            .ok_or_else(|| LinkError::Configuration("consumer needs a handler".to_owned()))?;
        Ok(Consumer::start(
            self.prefetch,
            self.auto_ack,
            self.requeue_on_error,
            topology,
            handler,
            self.channel_factory,
        ))
    }
}

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;
