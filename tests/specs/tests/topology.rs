// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topology scenarios: one-shot declaration against a stale broker, and
//! persistent topology surviving repeated channel loss.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tether::{ExchangeKind, LinkError, TopologyState};
use tether_specs::{build_link, eventually, init_tracing, ChaosBroker};
use tokio_util::sync::CancellationToken;

// ── S4: once topology on a stale broker ───────────────────────────────────

#[tokio::test]
async fn once_wait_fails_on_a_missing_passive_queue() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    broker.reject_passive("expected-by-deploy");
    let link = build_link(&broker)?;
    link.initialize();

    let topology = link
        .topology()
        .configure(|ops| async move {
            ops.queue_declare_passive("expected-by-deploy").await?;
            Ok(())
        })
        .build()?;

    let cancel = CancellationToken::new();
    let result = topology.wait(&cancel).await;
    assert!(matches!(result, Err(LinkError::Rejected { code: 404, .. })));

    // The runner gives up and disposes itself after the reject.
    eventually("self dispose", || topology.state() == TopologyState::Disposed).await;
    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn once_topology_declares_exactly_once() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();

    let topology = link
        .topology()
        .configure(|ops| async move {
            ops.exchange_declare("once.x", ExchangeKind::Direct, true, false).await
        })
        .build()?;
    let cancel = CancellationToken::new();
    topology.wait(&cancel).await?;

    eventually("self dispose", || topology.state() == TopologyState::Disposed).await;
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    assert_eq!(broker.declare_count("exchange:once.x"), 1);
    link.dispose().await;
    Ok(())
}

// ── S5: persistent topology survives channel loss ─────────────────────────

#[tokio::test]
async fn persistent_topology_redeclares_across_channel_kills() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    let link = build_link(&broker)?;
    link.initialize();

    let ready_passes = Arc::new(AtomicU32::new(0));
    let topology = link
        .topology()
        .persistent()
        .configure(|ops| async move {
            ops.exchange_declare("x", ExchangeKind::Fanout, true, false).await?;
            ops.queue_declare_durable("q").await?;
            ops.bind("q", "x", "").await
        })
        .on_ready({
            let ready_passes = Arc::clone(&ready_passes);
            move || {
                ready_passes.fetch_add(1, Ordering::AcqRel);
            }
        })
        .build()?;

    let cancel = CancellationToken::new();
    topology.wait(&cancel).await?;
    assert_eq!(topology.state(), TopologyState::Configured);

    // Two channel losses: each fresh channel re-runs the idempotent pass.
    for round in 2..=3u32 {
        broker.kill_latest_channel();
        let ready_passes = Arc::clone(&ready_passes);
        eventually("redeclare pass", move || ready_passes.load(Ordering::Acquire) >= round).await;
    }

    assert!(ready_passes.load(Ordering::Acquire) >= 3);
    assert!(broker.declare_count("exchange:x") >= 3);
    assert!(broker.declare_count("queue:q") >= 3);
    assert!(broker.declare_count("bind:q:x") >= 3);
    assert_eq!(topology.state(), TopologyState::Configured);

    topology.dispose().await;
    assert_eq!(topology.state(), TopologyState::Disposed);
    link.dispose().await;
    Ok(())
}

#[tokio::test]
async fn persistent_error_hook_sees_every_failed_pass() -> anyhow::Result<()> {
    init_tracing();
    let broker = ChaosBroker::new();
    broker.reject_passive("not-there-yet");
    let link = build_link(&broker)?;
    link.initialize();

    let failures = Arc::new(AtomicU32::new(0));
    let topology = link
        .topology()
        .persistent()
        .configure(|ops| async move {
            ops.queue_declare_passive("not-there-yet").await?;
            Ok(())
        })
        .on_error({
            let failures = Arc::clone(&failures);
            move |_error: &LinkError| {
                failures.fetch_add(1, Ordering::AcqRel);
            }
        })
        .build()?;

    {
        let failures = Arc::clone(&failures);
        eventually("two failed passes", move || failures.load(Ordering::Acquire) >= 2).await;
    }
    assert_eq!(topology.state(), TopologyState::NotConfigured);

    topology.dispose().await;
    link.dispose().await;
    Ok(())
}
