// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Link configuration, immutable after build.

use std::time::Duration;

use crate::error::LinkError;

/// Everything a [`Link`] needs to know, validated once at build time.
///
/// [`Link`]: crate::link::Link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Broker target, `amqp://` or `amqps://`.
    pub url: String,
    /// Tags outbound messages; used by `Delivery::is_from_this_app`.
    pub app_id: String,
    /// Displayed name on the broker.
    pub connection_name: String,
    /// Deadline for a single open attempt.
    pub connection_timeout: Duration,
    /// Sleep between reconnect attempts.
    pub connection_recovery_interval: Duration,
    /// Sleep between channel re-open attempts.
    pub channel_recovery_interval: Duration,
    /// Sleep between topology re-declare attempts.
    pub topology_recovery_interval: Duration,
    /// Start connecting from the constructor.
    pub auto_start: bool,
    /// Enable publisher confirms.
    pub confirm_mode: bool,
    /// Consumer QoS.
    pub prefetch: u16,
    /// Per-message confirm deadline; `None` waits indefinitely.
    pub publish_confirm_timeout: Option<Duration>,
    /// Soft ceiling on queued-but-undispatched publishes; `publish` blocks
    /// above it until the pump catches up.
    pub publish_queue_ceiling: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            app_id: "tether".to_owned(),
            connection_name: "tether".to_owned(),
            connection_timeout: Duration::from_secs(10),
            connection_recovery_interval: Duration::from_secs(10),
            channel_recovery_interval: Duration::from_secs(1),
            topology_recovery_interval: Duration::from_secs(10),
            auto_start: true,
            confirm_mode: true,
            prefetch: 1,
            publish_confirm_timeout: Some(Duration::from_secs(30)),
            publish_queue_ceiling: 1024,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), LinkError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| LinkError::Configuration(format!("invalid broker url: {e}")))?;
        if !matches!(url.scheme(), "amqp" | "amqps") {
            return Err(LinkError::Configuration(format!(
                "unsupported url scheme '{}', expected amqp or amqps",
                url.scheme()
            )));
        }
        if self.app_id.is_empty() {
            return Err(LinkError::Configuration("app_id must not be empty".to_owned()));
        }
        if self.connection_name.is_empty() {
            return Err(LinkError::Configuration("connection_name must not be empty".to_owned()));
        }
        if self.connection_timeout.is_zero() {
            return Err(LinkError::Configuration("connection_timeout must be positive".to_owned()));
        }
        if self.connection_recovery_interval.is_zero() {
            return Err(LinkError::Configuration(
                "connection_recovery_interval must be positive".to_owned(),
            ));
        }
        if self.topology_recovery_interval.is_zero() {
            return Err(LinkError::Configuration(
                "topology_recovery_interval must be positive".to_owned(),
            ));
        }
        if self.publish_queue_ceiling == 0 {
            return Err(LinkError::Configuration(
                "publish_queue_ceiling must be positive".to_owned(),
            ));
        }
        if let Some(timeout) = self.publish_confirm_timeout {
            if timeout.is_zero() {
                return Err(LinkError::Configuration(
                    "publish_confirm_timeout must be positive".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
