// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection supervisor: owns the one live transport connection.
//!
//! State machine, driven through the supervisor's [`EventLoop`]:
//!
//! ```text
//! Init --initialize--> Opening --success--> Open
//! Opening --failure--> Opening          (after connection_recovery_interval)
//! Open --shutdown(peer|library)--> Opening (after connection_recovery_interval)
//! Open --shutdown(application)--> Disposed
//! Any --dispose--> Disposed
//! ```
//!
//! Open failures are retried indefinitely; only disposal stops the loop.
//! Transport notices are posted onto the loop before they touch state, so
//! `Disconnected` events are serialized with the channel-creation requests
//! that must fail NotConnected.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::event_loop::{DisposeMode, EventLoop};
use crate::id::correlation_id;
use crate::transport::{
    ConnectionNotice, Shutdown, ShutdownInitiator, Transport, TransportChannel,
    TransportConnection,
};
use crate::work_item::PromiseFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Opening,
    Open,
    Disposed,
}

/// User-visible lifecycle events.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connected,
    Disconnected { initiator: ShutdownInitiator, code: u16, reason: String },
    Disposed,
}

pub struct ConnectionSupervisor {
    id: String,
    config: Arc<LinkConfig>,
    transport: Arc<dyn Transport>,
    event_loop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
    blocked_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<LinkEvent>,
    dispose: CancellationToken,
    initialized: AtomicBool,
    disposing: AtomicBool,
    /// Only mutated from loop units.
    current: Mutex<Option<Arc<dyn TransportConnection>>>,
    /// Bumped per successful open; stale notices identify themselves by it.
    epoch: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(config: Arc<LinkConfig>, transport: Arc<dyn Transport>) -> Arc<Self> {
        let id = correlation_id("conn");
        let (state_tx, _) = watch::channel(ConnectionState::Init);
        let (blocked_tx, _) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            event_loop: EventLoop::new(id.clone()),
            id,
            config,
            transport,
            state_tx,
            blocked_tx,
            events_tx,
            dispose: CancellationToken::new(),
            initialized: AtomicBool::new(false),
            disposing: AtomicBool::new(false),
            current: Mutex::new(None),
            epoch: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Broker flow-control flag; true while the broker blocks publishes.
    pub fn watch_blocked(&self) -> watch::Receiver<bool> {
        self.blocked_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }

    pub fn dispose_token(&self) -> &CancellationToken {
        &self.dispose
    }

    /// Start connecting. Idempotent.
    pub fn initialize(self: &Arc<Self>) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(conn_id = %self.id, url = %self.config.url, "initializing connection");
        self.schedule_connect(Duration::ZERO);
    }

    /// Create a fresh model on the current connection.
    ///
    /// Fails NotConnected unless the supervisor is Open when the unit runs.
    pub fn create_channel(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> PromiseFuture<Arc<dyn TransportChannel>> {
        let this = Arc::clone(self);
        self.event_loop.schedule(cancel, move |_token| async move {
            if this.state() != ConnectionState::Open {
                return Err(LinkError::NotConnected);
            }
            let connection =
                this.current.lock().clone().ok_or(LinkError::NotConnected)?;
            connection.create_channel().await.map_err(LinkError::from)
        })
    }

    /// Dispose the supervisor: close the connection, emit `Disposed`, stop
    /// the loop. Terminal and idempotent.
    pub async fn dispose(self: &Arc<Self>) {
        self.dispose.cancel();
        if self.disposing.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let fresh = CancellationToken::new();
        let _ = self
            .event_loop
            .schedule(&fresh, move |_token| async move {
                this.finish_dispose().await;
                Ok(())
            })
            .await;
        self.event_loop.dispose(DisposeMode::Wait).await;
    }

    async fn finish_dispose(self: &Arc<Self>) {
        if self.state() == ConnectionState::Disposed {
            return;
        }
        self.drop_current().await;
        self.state_tx.send_replace(ConnectionState::Disposed);
        let _ = self.events_tx.send(LinkEvent::Disposed);
        tracing::info!(conn_id = %self.id, "connection supervisor disposed");
    }

    fn schedule_connect(self: &Arc<Self>, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = this.dispose.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let unit = Arc::clone(&this);
            let _ = this.event_loop.schedule(&this.dispose, move |token| async move {
                unit.connect_unit(token).await;
                Ok(())
            });
        });
    }

    async fn connect_unit(self: &Arc<Self>, cancel: CancellationToken) {
        if self.dispose.is_cancelled() || self.state() == ConnectionState::Disposed {
            return;
        }
        if self.state() == ConnectionState::Open {
            // A retry raced a successful reconnect; nothing to do.
            return;
        }
        self.state_tx.send_replace(ConnectionState::Opening);
        self.drop_current().await;

        let opened = self
            .transport
            .open(
                &self.config.url,
                &self.config.connection_name,
                self.config.connection_timeout,
                &cancel,
            )
            .await;
        match opened {
            Ok(connection) => {
                let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
                let notices = connection.take_notices();
                let endpoint = connection.endpoint();
                *self.current.lock() = Some(connection);
                self.blocked_tx.send_replace(false);
                self.state_tx.send_replace(ConnectionState::Open);
                tracing::info!(
                    conn_id = %self.id,
                    host = %endpoint.host,
                    port = endpoint.port,
                    epoch,
                    "connection open"
                );
                let _ = self.events_tx.send(LinkEvent::Connected);
                if let Some(notices) = notices {
                    self.spawn_notice_pump(epoch, notices);
                }
            }
            Err(error) => {
                if self.dispose.is_cancelled() {
                    return;
                }
                tracing::warn!(
                    conn_id = %self.id,
                    err = %error,
                    retry_in_ms = self.config.connection_recovery_interval.as_millis() as u64,
                    "connection open failed"
                );
                self.schedule_connect(self.config.connection_recovery_interval);
            }
        }
    }

    fn spawn_notice_pump(
        self: &Arc<Self>,
        epoch: u64,
        mut notices: mpsc::UnboundedReceiver<ConnectionNotice>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = this.dispose.cancelled() => break,
                    notice = notices.recv() => match notice {
                        Some(notice) => notice,
                        None => break,
                    },
                };
                match notice {
                    ConnectionNotice::Shutdown(shutdown) => {
                        let unit = Arc::clone(&this);
                        let _ = this.event_loop.schedule(
                            &CancellationToken::new(),
                            move |_token| async move {
                                unit.shutdown_unit(epoch, shutdown).await;
                                Ok(())
                            },
                        );
                        break;
                    }
                    ConnectionNotice::Blocked { reason } => {
                        let unit = Arc::clone(&this);
                        let _ = this.event_loop.schedule(
                            &CancellationToken::new(),
                            move |_token| async move {
                                unit.flow_unit(epoch, Some(reason));
                                Ok(())
                            },
                        );
                    }
                    ConnectionNotice::Unblocked => {
                        let unit = Arc::clone(&this);
                        let _ = this.event_loop.schedule(
                            &CancellationToken::new(),
                            move |_token| async move {
                                unit.flow_unit(epoch, None);
                                Ok(())
                            },
                        );
                    }
                }
            }
        });
    }

    /// Broker flow control, serialized through the loop like every other
    /// transport notice. `Some(reason)` blocks publishing, `None` resumes.
    fn flow_unit(&self, epoch: u64, reason: Option<String>) {
        if self.dispose.is_cancelled() || self.state() == ConnectionState::Disposed {
            return;
        }
        if epoch != self.epoch.load(Ordering::Acquire) {
            // Notice from an already-replaced connection.
            return;
        }
        match reason {
            Some(reason) => {
                tracing::warn!(conn_id = %self.id, reason = %reason, "broker blocked publishes");
                self.blocked_tx.send_replace(true);
            }
            None => {
                tracing::info!(conn_id = %self.id, "broker unblocked publishes");
                self.blocked_tx.send_replace(false);
            }
        }
    }

    async fn shutdown_unit(self: &Arc<Self>, epoch: u64, shutdown: Shutdown) {
        if self.dispose.is_cancelled() || self.state() == ConnectionState::Disposed {
            return;
        }
        if epoch != self.epoch.load(Ordering::Acquire) {
            // Notice from an already-replaced connection.
            return;
        }
        tracing::warn!(
            conn_id = %self.id,
            initiator = ?shutdown.initiator,
            code = shutdown.code,
            reason = %shutdown.reason,
            "connection shut down"
        );
        self.drop_current().await;
        let _ = self.events_tx.send(LinkEvent::Disconnected {
            initiator: shutdown.initiator,
            code: shutdown.code,
            reason: shutdown.reason,
        });
        match shutdown.initiator {
            ShutdownInitiator::Application => {
                self.state_tx.send_replace(ConnectionState::Disposed);
                let _ = self.events_tx.send(LinkEvent::Disposed);
                self.dispose.cancel();
            }
            ShutdownInitiator::Library | ShutdownInitiator::Peer => {
                self.state_tx.send_replace(ConnectionState::Opening);
                self.schedule_connect(self.config.connection_recovery_interval);
            }
        }
    }

    async fn drop_current(&self) {
        let previous = self.current.lock().take();
        if let Some(connection) = previous {
            if let Err(error) = connection.close().await {
                tracing::debug!(conn_id = %self.id, err = %error, "closing previous connection failed");
            }
        }
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
