// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection-level scenarios: broker outage and recovery cadence,
//! lifecycle events, cascading disposal.

use std::time::Duration;

use tether::{LinkError, LinkEvent, OutboundMessage, ShutdownInitiator};
use tether_specs::{build_link, eventually, fast_config, init_tracing, ChaosBroker};
use tokio_util::sync::CancellationToken;

// ── S3: connection drop ───────────────────────────────────────────────────

#[tokio::test]
async fn broker_outage_reconnects_with_single_events() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    let mut events = link.events();
    link.initialize();
    eventually("initial connect", || link.is_connected()).await;
    assert!(matches!(events.recv().await?, LinkEvent::Connected));
    let attempts_before = broker.connect_attempts();

    // Take the broker away for roughly three recovery intervals.
    broker.refuse_next_connects(3);
    broker.drop_connection();

    match events.recv().await? {
        LinkEvent::Disconnected { initiator, .. } => {
            assert_eq!(initiator, ShutdownInitiator::Peer);
        }
        other => anyhow::bail!("expected Disconnected, got {other:?}"),
    }
    assert!(matches!(events.recv().await?, LinkEvent::Connected));
    eventually("reconnected", || link.is_connected()).await;

    // One refused attempt per recovery interval, then the success.
    assert_eq!(broker.connect_attempts() - attempts_before, 4);
    assert_eq!(broker.connection_count(), 2);

    // Exactly one Disconnected and one Connected: the feed is quiet now.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn reconnect_cadence_respects_the_recovery_interval() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    broker.refuse_next_connects(4);
    let link = build_link(&broker)?;

    let started = tokio::time::Instant::now();
    link.initialize();
    eventually("connected after refusals", || link.is_connected()).await;

    // Four failures sleep the interval each before the fifth succeeds.
    let minimum = fast_config().connection_recovery_interval * 4;
    assert!(started.elapsed() >= minimum, "reconnect cadence ran too hot");
    assert_eq!(broker.connect_attempts(), 5);
    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn dependent_channels_recover_with_the_connection() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();

    let producer = link.producer().build();
    let cancel = CancellationToken::new();
    producer.publish(OutboundMessage::bytes("before").to_exchange("e"), &cancel).await?;

    broker.drop_connection();
    // The same producer keeps working once the link heals.
    producer.publish(OutboundMessage::bytes("after").to_exchange("e"), &cancel).await?;

    let connections: Vec<u32> = broker.published().iter().map(|p| p.connection).collect();
    assert_eq!(connections, vec![1, 2]);
    link.dispose().await;
    Ok(())
}

// ── disposal ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn dispose_is_terminal() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();
    eventually("connected", || link.is_connected()).await;

    let producer = link.producer().build();
    link.dispose().await;

    let cancel = CancellationToken::new();
    let result = producer.publish(OutboundMessage::bytes("late").to_exchange("e"), &cancel).await;
    assert_eq!(result.unwrap_err(), LinkError::Disposed);

    // No reconnect attempts happen after disposal.
    let attempts = broker.connect_attempts();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.connect_attempts(), attempts);
    Ok(())
}

#[tokio::test]
async fn queued_publishes_survive_an_outage_window() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();
    let producer = link.producer().build();
    let cancel = CancellationToken::new();
    producer.publish(OutboundMessage::bytes("warm-up").to_exchange("e"), &cancel).await?;

    // Outage: drop and refuse a couple of reconnects, publish meanwhile.
    broker.refuse_next_connects(2);
    broker.drop_connection();
    let held = producer
        .publish_deferred(OutboundMessage::bytes("held").to_exchange("e"), &cancel)
        .await?;

    held.await?;
    let bodies: Vec<_> = broker.published().iter().map(|p| p.body.clone()).collect();
    assert_eq!(bodies.last().map(|b| b.as_ref()), Some(&b"held"[..]));
    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn blocked_broker_defers_publishes_until_unblocked() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();
    let producer = link.producer().build();
    let cancel = CancellationToken::new();
    producer.publish(OutboundMessage::bytes("warm-up").to_exchange("e"), &cancel).await?;

    broker.block("memory alarm");
    tokio::time::sleep(Duration::from_millis(30)).await;
    let held = producer
        .publish_deferred(OutboundMessage::bytes("held").to_exchange("e"), &cancel)
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.published().len(), 1, "publish went out while blocked");

    broker.unblock();
    held.await?;
    assert_eq!(broker.published().len(), 2);
    link.dispose().await;
    Ok(())
}
