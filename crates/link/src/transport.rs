// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The transport interface the supervisors drive.
//!
//! Implementations own the AMQP wire codec and framing; the core only sees
//! a connection factory, per-connection channel creation, the method-call
//! RPCs below, and asynchronous notices (shutdowns, confirms, returns)
//! delivered as messages.
//!
//! Threading contract: a [`TransportChannel`] is only ever called from its
//! channel supervisor's loop. Calls may interleave at await points but
//! never run in parallel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::message::MessageProperties;

/// Argument/header table. Insertion order is preserved on the wire.
pub type Arguments = IndexMap<String, serde_json::Value>;

/// Who initiated a shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownInitiator {
    /// This library asked for the close (normal disposal).
    Application,
    /// A local fault inside the transport.
    Library,
    /// The broker or the network.
    Peer,
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    pub initiator: ShutdownInitiator,
    pub code: u16,
    pub reason: String,
}

/// Asynchronous notice from a connection.
#[derive(Debug, Clone)]
pub enum ConnectionNotice {
    Shutdown(Shutdown),
    /// The broker stopped accepting publishes (resource pressure).
    Blocked { reason: String },
    Unblocked,
}

/// A mandatory publish that came back unroutable.
#[derive(Debug, Clone)]
pub struct ReturnedPublish {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// Asynchronous notice from a channel, in broker receipt order.
#[derive(Debug, Clone)]
pub enum ChannelNotice {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool, requeue: bool },
    Return(ReturnedPublish),
    Shutdown(Shutdown),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone)]
pub struct QueueSpec {
    /// Empty means server-named.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

/// `queue.declare-ok` payload.
#[derive(Debug, Clone)]
pub struct QueueOk {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A delivery as the transport hands it over, before the supervisor stamps
/// the channel generation onto it.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

/// Connection factory.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection, bounded by `timeout` and `cancel`.
    async fn open(
        &self,
        url: &str,
        connection_name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    fn is_open(&self) -> bool;
    fn endpoint(&self) -> Endpoint;
    fn local_port(&self) -> Option<u16>;

    /// Single-consumer notice stream; `None` after the first call.
    fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<ConnectionNotice>>;

    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Single-consumer notice stream; `None` after the first call.
    fn take_notices(&self) -> Option<mpsc::UnboundedReceiver<ChannelNotice>>;

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;
    async fn exchange_declare_passive(&self, name: &str) -> Result<(), TransportError>;
    async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), TransportError>;

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<QueueOk, TransportError>;
    async fn queue_declare_passive(&self, name: &str) -> Result<QueueOk, TransportError>;
    async fn queue_delete(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, TransportError>;
    async fn queue_purge(&self, name: &str) -> Result<u32, TransportError>;
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError>;
    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: &Arguments,
    ) -> Result<(), TransportError>;

    /// Put the channel in publisher-confirm mode. Delivery tags restart at
    /// 1 and increment per accepted publish.
    async fn confirm_select(&self) -> Result<(), TransportError>;
    async fn basic_qos(&self, prefetch: u16) -> Result<(), TransportError>;
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: &MessageProperties,
        body: Bytes,
    ) -> Result<(), TransportError>;
    /// Start a consumer; deliveries arrive on the returned stream until the
    /// consumer is canceled or the channel dies.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<mpsc::UnboundedReceiver<RawDelivery>, TransportError>;
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), TransportError>;
    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), TransportError>;
    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

impl std::fmt::Debug for dyn TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel").finish()
    }
}
