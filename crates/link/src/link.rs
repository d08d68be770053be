// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The public façade: one [`Link`] per broker relationship.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::channel::ChannelSupervisor;
use crate::config::LinkConfig;
use crate::connection::{ConnectionState, ConnectionSupervisor, LinkEvent};
use crate::consumer::ConsumerBuilder;
use crate::error::LinkError;
use crate::producer::{Producer, ProducerCore};
use crate::topology::{ConfigureFn, ErrorFn, ReadyFn, Topology, TopologyMode, TopologyOps};
use crate::transport::Transport;

/// A long-lived, self-healing relationship with one broker.
///
/// Construct with [`Link::builder`], then create topologies, producers and
/// consumers from it. Disposing the link cascades to every child channel.
pub struct Link {
    config: Arc<LinkConfig>,
    connection: Arc<ConnectionSupervisor>,
    channels: Arc<Mutex<Vec<std::sync::Weak<ChannelSupervisor>>>>,
}

fn track_channel(
    channels: &Mutex<Vec<std::sync::Weak<ChannelSupervisor>>>,
    channel: &Arc<ChannelSupervisor>,
) {
    let mut channels = channels.lock();
    channels.retain(|weak| weak.strong_count() > 0);
    channels.push(Arc::downgrade(channel));
}

impl Link {
    pub fn builder(url: impl Into<String>) -> LinkBuilder {
        LinkBuilder { config: LinkConfig { url: url.into(), ..LinkConfig::default() }, transport: None }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Lifecycle events: Connected / Disconnected / Disposed.
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.connection.subscribe()
    }

    /// Start connecting. Idempotent; implicit when `auto_start` is set.
    pub fn initialize(&self) {
        self.connection.initialize();
    }

    /// Build a topology component on its own channel.
    pub fn topology(&self) -> TopologyComponentBuilder<'_> {
        TopologyComponentBuilder {
            link: self,
            mode: TopologyMode::Once,
            configure: None,
            ready: None,
            error: None,
        }
    }

    /// Build a producer on its own channel.
    pub fn producer(&self) -> ProducerBuilder<'_> {
        ProducerBuilder {
            link: self,
            confirm_mode: self.config.confirm_mode,
            topology: None,
        }
    }

    /// Build a consumer on its own channel.
    pub fn consumer(&self) -> ConsumerBuilder {
        let connection = Arc::clone(&self.connection);
        let config = Arc::clone(&self.config);
        let channels = Arc::clone(&self.channels);
        ConsumerBuilder {
            prefetch: self.config.prefetch,
            auto_ack: false,
            requeue_on_error: true,
            topology: None,
            handler: None,
            channel_factory: Box::new(move |core| {
                let channel = ChannelSupervisor::spawn(config, connection, core);
                track_channel(&channels, &channel);
                channel
            }),
        }
    }

    /// Dispose every child channel, then the connection. Terminal.
    pub async fn dispose(&self) {
        let children: Vec<_> = {
            let mut channels = self.channels.lock();
            channels.drain(..).filter_map(|weak| weak.upgrade()).collect()
        };
        for channel in children {
            channel.dispose().await;
        }
        self.connection.dispose().await;
    }

    fn register_channel(&self, channel: &Arc<ChannelSupervisor>) {
        track_channel(&self.channels, channel);
    }
}

/// Fluent configuration for a [`Link`].
pub struct LinkBuilder {
    config: LinkConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl LinkBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.config.app_id = app_id.into();
        self
    }

    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.config.connection_name = name.into();
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn connection_recovery_interval(mut self, interval: Duration) -> Self {
        self.config.connection_recovery_interval = interval;
        self
    }

    pub fn channel_recovery_interval(mut self, interval: Duration) -> Self {
        self.config.channel_recovery_interval = interval;
        self
    }

    pub fn topology_recovery_interval(mut self, interval: Duration) -> Self {
        self.config.topology_recovery_interval = interval;
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.config.auto_start = auto_start;
        self
    }

    pub fn confirm_mode(mut self, confirm_mode: bool) -> Self {
        self.config.confirm_mode = confirm_mode;
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.config.prefetch = prefetch;
        self
    }

    pub fn publish_confirm_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.publish_confirm_timeout = timeout;
        self
    }

    pub fn publish_queue_ceiling(mut self, ceiling: usize) -> Self {
        self.config.publish_queue_ceiling = ceiling;
        self
    }

    pub fn build(self) -> Result<Link, LinkError> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| LinkError::Configuration("a transport is required".to_owned()))?;
        let config = Arc::new(self.config);
        let connection = ConnectionSupervisor::new(Arc::clone(&config), transport);
        if config.auto_start {
            connection.initialize();
        }
        Ok(Link { config, connection, channels: Arc::new(Mutex::new(Vec::new())) })
    }
}

/// Builder for a [`Topology`] component.
pub struct TopologyComponentBuilder<'a> {
    link: &'a Link,
    mode: TopologyMode,
    configure: Option<ConfigureFn>,
    ready: Option<ReadyFn>,
    error: Option<ErrorFn>,
}

impl<'a> TopologyComponentBuilder<'a> {
    /// Re-declare on every channel activation (default is Once).
    pub fn persistent(mut self) -> Self {
        self.mode = TopologyMode::Persistent;
        self
    }

    pub fn configure<F, Fut>(mut self, configure: F) -> Self
    where
        F: Fn(TopologyOps) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        self.configure = Some(crate::topology::configure_fn(configure));
        self
    }

    /// Hook fired after every successful declaration pass.
    pub fn on_ready<F: Fn() + Send + Sync + 'static>(mut self, ready: F) -> Self {
        self.ready = Some(Arc::new(ready));
        self
    }

    /// Hook fired on every failed declaration pass.
    pub fn on_error<F: Fn(&LinkError) + Send + Sync + 'static>(mut self, error: F) -> Self {
        self.error = Some(Arc::new(error));
        self
    }

    pub fn build(self) -> Result<Topology, LinkError> {
        let configure = self.configure.ok_or_else(|| {
            LinkError::Configuration("topology needs a configure callback".to_owned())
        })?;
        let link = self.link;
        let config = Arc::clone(&link.config);
        let connection = Arc::clone(&link.connection);
        Ok(Topology::start(
            Arc::clone(&link.config),
            move |runner| {
                let channel = ChannelSupervisor::spawn(config, connection, runner);
                link.register_channel(&channel);
                channel
            },
            self.mode,
            configure,
            self.ready,
            self.error,
        ))
    }
}

/// Builder for a [`Producer`].
pub struct ProducerBuilder<'a> {
    link: &'a Link,
    confirm_mode: bool,
    topology: Option<ConfigureFn>,
}

impl<'a> ProducerBuilder<'a> {
    /// Override the link-wide confirm-mode flag for this producer.
    pub fn confirm_mode(mut self, confirm_mode: bool) -> Self {
        self.confirm_mode = confirm_mode;
        self
    }

    /// Topology declared on every activation before publishing resumes
    /// (typically the target exchange).
    pub fn topology<F, Fut>(mut self, configure: F) -> Self
    where
        F: Fn(TopologyOps) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), LinkError>> + Send + 'static,
    {
        self.topology = Some(crate::topology::configure_fn(configure));
        self
    }

    pub fn build(self) -> Producer {
        let link = self.link;
        let config = Arc::clone(&link.config);
        let connection = Arc::clone(&link.connection);
        Producer::start(
            Arc::clone(&link.config),
            self.confirm_mode,
            self.topology,
            link.connection.watch_blocked(),
            move |core: Arc<ProducerCore>| {
                let channel = ChannelSupervisor::spawn(config, connection, core);
                link.register_channel(&channel);
                channel
            },
        )
    }
}

#[cfg(test)]
#[path = "link_tests.rs"]
mod tests;
