// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Consumer scenarios: end-to-end routing, prefetch-bounded delivery,
//! handler cancellation, and nack-driven redelivery.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether::{
    ConsumeOutcome, Delivery, DeliveryHandler, ExchangeKind, LinkError, OutboundMessage,
};
use tether_specs::{build_link, eventually, init_tracing, ChaosBroker};
use tokio_util::sync::CancellationToken;

struct CountingHandler {
    bodies: Mutex<Vec<String>>,
    redelivered: Mutex<Vec<bool>>,
    invocations: AtomicU32,
    nack_first: AtomicU32,
    gate: Option<Arc<tokio::sync::Notify>>,
}

impl CountingHandler {
    fn acking() -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(Vec::new()),
            redelivered: Mutex::new(Vec::new()),
            invocations: AtomicU32::new(0),
            nack_first: AtomicU32::new(0),
            gate: None,
        })
    }

    fn nacking_first(n: u32) -> Arc<Self> {
        let handler = Self::acking();
        handler.nack_first.store(n, Ordering::Release);
        handler
    }

    fn gated(gate: Arc<tokio::sync::Notify>) -> Arc<Self> {
        Arc::new(Self {
            bodies: Mutex::new(Vec::new()),
            redelivered: Mutex::new(Vec::new()),
            invocations: AtomicU32::new(0),
            nack_first: AtomicU32::new(0),
            gate: Some(gate),
        })
    }
}

#[async_trait]
impl DeliveryHandler for CountingHandler {
    async fn handle(
        &self,
        delivery: Delivery,
        cancel: CancellationToken,
    ) -> Result<ConsumeOutcome, LinkError> {
        self.invocations.fetch_add(1, Ordering::AcqRel);
        self.bodies.lock().push(String::from_utf8_lossy(&delivery.body).into_owned());
        self.redelivered.lock().push(delivery.redelivered);
        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = gate.notified() => {}
                _ = cancel.cancelled() => return Err(LinkError::Canceled),
            }
        }
        let nacks = self.nack_first.load(Ordering::Acquire);
        if nacks > 0 {
            self.nack_first.store(nacks - 1, Ordering::Release);
            return Ok(ConsumeOutcome::Nack { requeue: true });
        }
        Ok(ConsumeOutcome::Ack)
    }
}

// ── end-to-end: publish, route, consume, ack ──────────────────────────────

#[tokio::test]
async fn published_messages_reach_the_consumer_and_drain_the_queue() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();

    let handler = CountingHandler::acking();
    let consumer = link
        .consumer()
        .topology(|ops| async move {
            ops.exchange_declare("orders", ExchangeKind::Direct, true, false).await?;
            ops.queue_declare_durable("orders.eu").await?;
            ops.bind("orders.eu", "orders", "eu").await?;
            Ok("orders.eu".to_owned())
        })
        .prefetch(8)
        .handler(Arc::clone(&handler) as _)
        .build()?;

    eventually("consumer topology", || broker.declare_count("bind:orders.eu:orders") >= 1).await;

    let producer = link.producer().build();
    let cancel = CancellationToken::new();
    for n in 0..5u32 {
        let message =
            OutboundMessage::bytes(format!("order-{n}")).to_exchange("orders").with_routing_key("eu");
        producer.publish(message, &cancel).await?;
    }

    {
        let handler = Arc::clone(&handler);
        eventually("all consumed", move || handler.invocations.load(Ordering::Acquire) == 5).await;
    }
    eventually("queue drained", || broker.queue_depth("orders.eu") == 0).await;
    eventually("nothing unacked", || broker.unacked_total() == 0).await;

    consumer.dispose().await;
    link.dispose().await;
    Ok(())
}

// ── S6: consumer handler cancellation ─────────────────────────────────────

#[tokio::test]
async fn dispose_with_parked_handler_leaves_messages_for_redelivery() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    for n in 0..10u32 {
        broker.seed_queue("inbox", &format!("m-{n}"));
    }
    let link = build_link(&broker)?;
    link.initialize();

    let gate = Arc::new(tokio::sync::Notify::new());
    let handler = CountingHandler::gated(Arc::clone(&gate));
    let consumer = link
        .consumer()
        .queue("inbox")
        .prefetch(2)
        .handler(Arc::clone(&handler) as _)
        .build()?;

    // Prefetch bounds the broker: at most 2 deliveries reach the handler
    // while it is parked on the gate.
    {
        let handler = Arc::clone(&handler);
        eventually("first delivery", move || handler.invocations.load(Ordering::Acquire) >= 1)
            .await;
    }
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(handler.invocations.load(Ordering::Acquire) <= 2);
    assert_eq!(broker.queue_depth("inbox"), 8);

    // Dispose before opening the gate: no ack may be sent, the broker
    // keeps every message.
    consumer.dispose().await;
    gate.notify_waiters();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(broker.queue_depth("inbox"), 10);
    assert_eq!(broker.unacked_total(), 0);

    link.dispose().await;
    Ok(())
}

// ── redelivery ────────────────────────────────────────────────────────────

#[tokio::test]
async fn nack_with_requeue_redelivers_the_message() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    broker.seed_queue("retry.q", "flaky");
    let link = build_link(&broker)?;
    link.initialize();

    let handler = CountingHandler::nacking_first(1);
    let consumer = link
        .consumer()
        .queue("retry.q")
        .prefetch(1)
        .handler(Arc::clone(&handler) as _)
        .build()?;

    {
        let handler = Arc::clone(&handler);
        eventually("redelivered and acked", move || {
            handler.invocations.load(Ordering::Acquire) == 2
        })
        .await;
    }
    assert_eq!(*handler.redelivered.lock(), vec![false, true]);
    eventually("drained", || broker.queue_depth("retry.q") == 0).await;

    consumer.dispose().await;
    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn channel_loss_redelivers_unacked_messages() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    broker.seed_queue("inbox", "survivor");
    let link = build_link(&broker)?;
    link.initialize();

    let gate = Arc::new(tokio::sync::Notify::new());
    let handler = CountingHandler::gated(Arc::clone(&gate));
    let consumer = link
        .consumer()
        .queue("inbox")
        .prefetch(1)
        .handler(Arc::clone(&handler) as _)
        .build()?;

    {
        let handler = Arc::clone(&handler);
        eventually("first delivery", move || handler.invocations.load(Ordering::Acquire) == 1)
            .await;
    }

    // Kill the channel while the message is unacked; the broker requeues
    // and the recovered consumer sees it again, marked redelivered.
    broker.kill_latest_channel();
    gate.notify_waiters();
    {
        let handler = Arc::clone(&handler);
        eventually("redelivery", move || handler.invocations.load(Ordering::Acquire) >= 2).await;
    }
    assert!(handler.redelivered.lock().iter().any(|redelivered| *redelivered));

    gate.notify_waiters();
    consumer.dispose().await;
    link.dispose().await;
    Ok(())
}
