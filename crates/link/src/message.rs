// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound messages and inbound deliveries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::LinkConfig;
use crate::transport::Arguments;

/// AMQP basic-properties subset carried on every message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
    pub app_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL.
    pub expiration: Option<Duration>,
    /// Epoch seconds.
    pub timestamp: Option<u64>,
    pub headers: Arguments,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

/// Where a publish goes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishTarget {
    pub exchange: String,
    pub routing_key: String,
    /// When set, an unroutable message comes back as a Return and fails
    /// the publish promise instead of being dropped by the broker.
    pub mandatory: bool,
}

/// A message handed to [`Producer::publish`].
///
/// [`Producer::publish`]: crate::producer::Producer::publish
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub target: PublishTarget,
    pub body: Bytes,
}

impl OutboundMessage {
    /// Message with a raw byte body and default properties.
    pub fn bytes(body: impl Into<Bytes>) -> Self {
        Self {
            properties: MessageProperties::default(),
            target: PublishTarget::default(),
            body: body.into(),
        }
    }

    /// Message with a JSON body and `application/json` content type.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        let mut message = Self::bytes(body);
        message.properties.content_type = Some("application/json".to_owned());
        Ok(message)
    }

    pub fn to_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.target.exchange = exchange.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.target.routing_key = routing_key.into();
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.target.mandatory = true;
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.properties.reply_to = Some(queue.into());
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.properties.expiration = Some(ttl);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.headers.insert(key.into(), value);
        self
    }

    /// Stamp the current wall-clock time into the timestamp property.
    pub fn with_timestamp_now(mut self) -> Self {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        self.properties.timestamp = Some(now.as_secs());
        self
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag, monotonic within the source channel.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub properties: MessageProperties,
    pub body: Bytes,
    /// Channel generation that produced this delivery. Tags are only valid
    /// against their own generation; outcomes for older generations are
    /// dropped because the broker has already requeued on channel close.
    pub(crate) generation: u64,
}

impl Delivery {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this message was published by this application, judged by
    /// the configured application id.
    pub fn is_from_this_app(&self, config: &LinkConfig) -> bool {
        self.properties.app_id.as_deref() == Some(config.app_id.as_str())
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
