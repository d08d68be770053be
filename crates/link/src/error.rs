// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error kinds surfaced by the link core.
//!
//! Transient wire faults stay inside the supervisors (logged, retried) and
//! never reach a caller; everything a caller can observe is a [`LinkError`].

use thiserror::Error;

/// Failure of an operation on a link, channel, producer, consumer or
/// topology handle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The caller's cancellation fired before the operation completed.
    #[error("operation canceled")]
    Canceled,

    /// The target supervisor has been disposed.
    #[error("target is disposed")]
    Disposed,

    /// The operation requires an open connection and there is none.
    #[error("connection is not open")]
    NotConnected,

    /// A recoverable wire or broker fault. Supervisors absorb these during
    /// recovery; they only surface on operations bound to a dead handle.
    #[error("transport failure: {0}")]
    Transport(TransportError),

    /// The broker refused a declare/bind/consume RPC.
    #[error("broker rejected the operation: {code} {text}")]
    Rejected { code: u16, text: String },

    /// The broker negatively confirmed a published message.
    #[error("message was nacked by the broker")]
    Nacked,

    /// A mandatory message was returned as unroutable.
    #[error("message was returned undeliverable: {code} {text}")]
    Returned { code: u16, text: String },

    /// No publisher confirm arrived within the configured deadline.
    #[error("publish confirm timed out")]
    PublishTimeout,

    /// The configuration was rejected at build time.
    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Socket-level or protocol-level failure.
    #[error("i/o failure: {0}")]
    Io(String),

    /// The broker answered an RPC with a definitive refusal.
    #[error("broker rejected: {code} {text}")]
    Rejected { code: u16, text: String },

    /// The channel carrying the RPC is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// The connection carrying the RPC is gone.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<TransportError> for LinkError {
    fn from(e: TransportError) -> Self {
        match e {
            // Definitive broker refusals keep their identity; everything
            // else is a recoverable transport fault.
            TransportError::Rejected { code, text } => LinkError::Rejected { code, text },
            other => LinkError::Transport(other),
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
