// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tether: a self-healing AMQP 0-9-1 client core.
//!
//! A [`Link`] owns one long-lived relationship with a message broker and
//! hides every transient failure — TCP drops, broker restarts, channel
//! faults, topology loss — behind persistent supervisors:
//!
//! - [`connection::ConnectionSupervisor`] keeps exactly one underlying
//!   connection alive, reconnecting forever until disposed.
//! - [`channel::ChannelSupervisor`] keeps one AMQP channel (model) open on
//!   that connection and hands it to an attached handler on every
//!   activation.
//! - [`topology::Topology`], [`producer::Producer`] and
//!   [`consumer::Consumer`] are the handlers: they re-declare topology,
//!   re-dispatch unconfirmed publishes and re-subscribe consumers on every
//!   fresh channel generation.
//!
//! The wire protocol itself is out of scope: the supervisors drive any
//! implementation of the [`transport`] trait family.

pub mod auto_cancel;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod event_loop;
pub mod id;
pub mod link;
pub mod message;
pub mod producer;
pub mod topology;
pub mod transport;
pub mod work_item;
pub mod work_queue;

#[cfg(test)]
pub(crate) mod test_support;

pub use auto_cancel::AutoCancellingQueue;
pub use channel::{ChannelContext, ChannelHandler, ChannelState, ChannelSupervisor};
pub use config::LinkConfig;
pub use connection::{ConnectionState, ConnectionSupervisor, LinkEvent};
pub use consumer::{
    consumer_topology_fn, ConsumeOutcome, Consumer, ConsumerBuilder, ConsumerTopologyFn,
    DeliveryHandler,
};
pub use error::{LinkError, TransportError};
pub use event_loop::{DisposeMode, EventLoop};
pub use link::{Link, LinkBuilder, ProducerBuilder, TopologyComponentBuilder};
pub use message::{Delivery, DeliveryMode, MessageProperties, OutboundMessage, PublishTarget};
pub use producer::Producer;
pub use topology::{
    configure_fn, ConfigureFn, ErrorFn, ReadyFn, Topology, TopologyMode, TopologyOps,
    TopologyState,
};
pub use transport::{
    Arguments, ChannelNotice, ConnectionNotice, Endpoint, ExchangeKind, ExchangeSpec, QueueOk,
    QueueSpec, RawDelivery, ReturnedPublish, Shutdown, ShutdownInitiator, Transport,
    TransportChannel, TransportConnection,
};
pub use work_item::{promise, Completion, PromiseFuture, WorkItem};
pub use work_queue::{CompositeWorkQueue, WorkQueue};
