// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Publish/confirm scenarios: happy path, broker nacks, unroutable
//! returns, and recovery of unconfirmed messages across a channel fault.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tether::{LinkError, OutboundMessage};
use tether_specs::{build_link, eventually, init_tracing, ChaosBroker};
use tokio_util::sync::CancellationToken;

// ── S1: publish/confirm happy path ────────────────────────────────────────

#[tokio::test]
async fn three_publishes_confirm_with_increasing_tags() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();

    let topology = link
        .topology()
        .configure(|ops| async move {
            ops.exchange_declare("e", tether::ExchangeKind::Fanout, true, false).await
        })
        .build()?;
    let cancel = CancellationToken::new();
    topology.wait(&cancel).await?;

    let producer = link.producer().build();
    for body in ["a", "b", "c"] {
        producer.publish(OutboundMessage::bytes(body).to_exchange("e"), &cancel).await?;
    }

    let tags: Vec<u64> = broker.published().iter().map(|p| p.tag).collect();
    assert_eq!(tags, vec![1, 2, 3]);
    assert_eq!(broker.total_acks(), 3);

    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn json_bodies_round_trip_through_the_broker() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();

    #[derive(Serialize)]
    struct Event {
        kind: &'static str,
        seq: u32,
    }

    let producer = link.producer().build();
    let cancel = CancellationToken::new();
    let message = OutboundMessage::json(&Event { kind: "created", seq: 1 })?.to_exchange("e");
    producer.publish(message, &cancel).await?;

    let published = broker.published();
    assert_eq!(published.len(), 1);
    let value: serde_json::Value = serde_json::from_slice(&published[0].body)?;
    assert_eq!(value["kind"], "created");
    assert_eq!(value["seq"], 1);

    link.dispose().await;
    Ok(())
}

// ── broker refusals ───────────────────────────────────────────────────────

#[tokio::test]
async fn nacked_message_fails_its_promise_only() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();
    let producer = link.producer().build();
    let cancel = CancellationToken::new();

    broker.nack_next_publishes(1);
    let doomed = producer.publish(OutboundMessage::bytes("doomed").to_exchange("e"), &cancel).await;
    assert_eq!(doomed.unwrap_err(), LinkError::Nacked);

    // The pipeline survives: the next message confirms normally.
    producer.publish(OutboundMessage::bytes("fine").to_exchange("e"), &cancel).await?;
    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn mandatory_unroutable_message_comes_back_returned() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();
    let producer = link.producer().build();
    let cancel = CancellationToken::new();

    // No binding for this exchange, so a mandatory publish has no route.
    let message = OutboundMessage::bytes("nowhere").to_exchange("void").mandatory();
    let result = producer.publish(message, &cancel).await;
    assert!(matches!(result, Err(LinkError::Returned { code: 312, .. })));

    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn confirm_mode_off_needs_no_broker_ack() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    broker.withhold_confirms(true);
    let link = build_link(&broker)?;
    link.initialize();

    let producer = link.producer().confirm_mode(false).build();
    let cancel = CancellationToken::new();
    producer.publish(OutboundMessage::bytes("untracked").to_exchange("e"), &cancel).await?;
    assert_eq!(broker.total_acks(), 0);

    link.dispose().await;
    Ok(())
}

// ── S2: channel fault mid-publish ─────────────────────────────────────────

#[tokio::test]
async fn channel_fault_mid_publish_loses_nothing() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();
    let producer = link.producer().build();
    let cancel = CancellationToken::new();

    // Kill the channel once roughly half the confirms are in.
    let killer = tokio::spawn({
        let broker = Arc::clone(&broker);
        async move {
            eventually("half the acks", || broker.total_acks() >= 50).await;
            broker.kill_latest_channel();
        }
    });

    let mut pending = Vec::new();
    for n in 0..100u32 {
        let message = OutboundMessage::bytes(format!("m-{n}")).to_exchange("e");
        pending.push(producer.publish_deferred(message, &cancel).await?);
    }
    for future in pending {
        future.await?;
    }
    killer.await?;

    // At-least-once: every payload made it to the broker, duplicates
    // permitted for messages in flight during the fault.
    let bodies: HashSet<Vec<u8>> =
        broker.published().iter().map(|p| p.body.to_vec()).collect();
    assert_eq!(bodies.len(), 100);
    link.dispose().await;
    Ok(())
}
