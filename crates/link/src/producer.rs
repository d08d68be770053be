// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Publishing pipeline with publisher confirms, retries and backpressure.
//!
//! ```text
//! publish() -> publish queue (auto-cancelling)
//!                  \
//!                   +-- serial pump (composite take) -> basic.publish
//!                  /                                       |
//! broker notices -+ (acks/nacks/returns as queue items)    v
//!                                             pending-confirm map
//! ```
//!
//! A message dispatched on generation G whose channel dies before its
//! confirm is re-queued at the head and re-dispatched on the next
//! activation; the user-visible promise object stays the same throughout.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::Key as TimeoutKey;
use tokio_util::time::DelayQueue;

use crate::auto_cancel::AutoCancellingQueue;
use crate::channel::{ChannelContext, ChannelHandler, ChannelSupervisor};
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::id::correlation_id;
use crate::message::OutboundMessage;
use crate::topology::{ConfigureFn, TopologyOps};
use crate::transport::ReturnedPublish;
use crate::work_item::WorkItem;
use crate::work_queue::{CompositeWorkQueue, WorkQueue};

/// What flows through the pump: user publishes and broker confirms,
/// multiplexed so both are handled by one serial strand.
pub(crate) enum PumpJob {
    Publish(OutboundMessage),
    Confirm(ConfirmEvent),
}

#[derive(Debug, Clone)]
pub(crate) enum ConfirmEvent {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, multiple: bool },
    Return { message_id: Option<String>, reply_code: u16, reply_text: String },
}

type PublishItem = Arc<WorkItem<PumpJob, ()>>;

struct PendingEntry {
    item: PublishItem,
    message_id: Option<String>,
    timeout: Option<TimeoutKey>,
}

/// Outstanding confirms keyed by the client-tracked delivery tag.
///
/// Tags restart at 1 per channel generation (confirm.select contract), so
/// the map never survives an activation: on Stop it drains, in tag order,
/// back into the publish queue.
#[derive(Default)]
pub(crate) struct PendingConfirms {
    entries: BTreeMap<u64, PendingEntry>,
}

impl PendingConfirms {
    fn insert(&mut self, tag: u64, entry: PendingEntry) {
        self.entries.insert(tag, entry);
    }

    /// Remove the entries settled by an ack/nack with the given tag.
    fn settle(&mut self, tag: u64, multiple: bool) -> Vec<PendingEntry> {
        if multiple {
            let rest = self.entries.split_off(&(tag + 1));
            let settled = std::mem::replace(&mut self.entries, rest);
            settled.into_values().collect()
        } else {
            self.entries.remove(&tag).into_iter().collect()
        }
    }

    fn take_by_message_id(&mut self, message_id: &str) -> Option<PendingEntry> {
        let tag = self
            .entries
            .iter()
            .find(|(_, entry)| entry.message_id.as_deref() == Some(message_id))
            .map(|(tag, _)| *tag)?;
        self.entries.remove(&tag)
    }

    fn remove(&mut self, tag: u64) -> Option<PendingEntry> {
        self.entries.remove(&tag)
    }

    fn drain_in_order(&mut self) -> Vec<PendingEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) struct ProducerCore {
    id: String,
    config: Arc<LinkConfig>,
    confirm_mode: bool,
    topology: Option<ConfigureFn>,
    publishes: AutoCancellingQueue<PumpJob, ()>,
    confirms: Arc<WorkQueue<PumpJob, ()>>,
    pump: CompositeWorkQueue<PumpJob, ()>,
    pending: Mutex<PendingConfirms>,
    blocked: watch::Receiver<bool>,
    dispose: CancellationToken,
}

impl ProducerCore {
    fn new(
        config: Arc<LinkConfig>,
        confirm_mode: bool,
        topology: Option<ConfigureFn>,
        blocked: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let publishes = AutoCancellingQueue::new();
        let confirms: Arc<WorkQueue<PumpJob, ()>> = Arc::new(WorkQueue::new());
        // Confirms first in the rotation: settling outstanding tags never
        // waits behind a burst of fresh publishes.
        let pump =
            CompositeWorkQueue::new(vec![Arc::clone(&confirms), publishes.inner()]);
        Arc::new(Self {
            id: correlation_id("prod"),
            config,
            confirm_mode,
            topology,
            publishes,
            confirms,
            pump,
            pending: Mutex::new(PendingConfirms::default()),
            blocked,
            dispose: CancellationToken::new(),
        })
    }

    fn enqueue_confirm(&self, event: ConfirmEvent) {
        let (item, _) = WorkItem::new(PumpJob::Confirm(event), CancellationToken::new());
        self.confirms.put(item);
    }

    fn apply_confirm(&self, event: &ConfirmEvent, timeouts: &mut DelayQueue<u64>) {
        match event {
            ConfirmEvent::Ack { delivery_tag, multiple } => {
                for entry in self.pending.lock().settle(*delivery_tag, *multiple) {
                    clear_timeout(timeouts, &entry);
                    entry.item.completion().succeed(());
                }
            }
            ConfirmEvent::Nack { delivery_tag, multiple } => {
                for entry in self.pending.lock().settle(*delivery_tag, *multiple) {
                    clear_timeout(timeouts, &entry);
                    tracing::warn!(prod_id = %self.id, delivery_tag, "publish nacked");
                    entry.item.completion().fail(LinkError::Nacked);
                }
            }
            ConfirmEvent::Return { message_id, reply_code, reply_text } => {
                let Some(message_id) = message_id else {
                    tracing::debug!(prod_id = %self.id, "return without message id, dropping");
                    return;
                };
                match self.pending.lock().take_by_message_id(message_id) {
                    Some(entry) => {
                        clear_timeout(timeouts, &entry);
                        tracing::warn!(
                            prod_id = %self.id,
                            message_id = %message_id,
                            reply_code,
                            "publish returned unroutable"
                        );
                        entry.item.completion().fail(LinkError::Returned {
                            code: *reply_code,
                            text: reply_text.clone(),
                        });
                    }
                    None => {
                        // The matching ack raced ahead of the return, or the
                        // message timed out; either way it is settled.
                        tracing::debug!(prod_id = %self.id, message_id = %message_id, "return for settled message");
                    }
                }
            }
        }
    }

    /// Fail every queued and pending message; further publishes fail too.
    fn shut_down(&self, error: LinkError) {
        self.dispose.cancel();
        self.publishes.close(error.clone());
        self.confirms.close(error.clone());
        for entry in self.pending.lock().drain_in_order() {
            entry.item.completion().fail(error.clone());
        }
    }

    /// Wait until the broker accepts publishes again.
    async fn wait_unblocked(
        &self,
        blocked: &mut watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            if !*blocked.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = blocked.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for ProducerCore {
    async fn on_active(
        &self,
        ctx: ChannelContext,
        active: CancellationToken,
    ) -> Result<(), LinkError> {
        if let Some(topology) = &self.topology {
            topology(TopologyOps::new(Arc::clone(&ctx.model))).await?;
        }
        if self.confirm_mode {
            ctx.model.confirm_select().await.map_err(LinkError::from)?;
        }

        let mut blocked = self.blocked.clone();
        let mut timeouts: DelayQueue<u64> = DelayQueue::new();
        let mut next_tag: u64 = 0;
        tracing::debug!(prod_id = %self.id, generation = ctx.generation, "producer pump started");

        let outcome = loop {
            tokio::select! {
                _ = active.cancelled() => break Ok(()),
                Some(expired) = timeouts.next() => {
                    let tag = expired.into_inner();
                    if let Some(entry) = self.pending.lock().remove(tag) {
                        tracing::warn!(prod_id = %self.id, delivery_tag = tag, "publish confirm timed out");
                        entry.item.completion().fail(LinkError::PublishTimeout);
                    }
                }
                taken = self.pump.take(&active) => {
                    let item = match taken {
                        Ok(item) => item,
                        Err(_) => break Ok(()),
                    };
                    match item.payload() {
                        PumpJob::Confirm(event) => {
                            let event = event.clone();
                            item.completion().succeed(());
                            self.apply_confirm(&event, &mut timeouts);
                        }
                        PumpJob::Publish(message) => {
                            let message = message.clone();
                            if *blocked.borrow() && !self.wait_unblocked(&mut blocked, &active).await {
                                self.publishes.put_retry(vec![item]);
                                break Ok(());
                            }
                            let sent = ctx.model.basic_publish(
                                &message.target.exchange,
                                &message.target.routing_key,
                                message.target.mandatory,
                                &message.properties,
                                message.body.clone(),
                            ).await;
                            match sent {
                                Ok(()) => {
                                    next_tag += 1;
                                    if self.confirm_mode {
                                        let timeout = self
                                            .config
                                            .publish_confirm_timeout
                                            .map(|after| timeouts.insert(next_tag, after));
                                        let entry = PendingEntry {
                                            message_id: message.properties.message_id.clone(),
                                            item: Arc::clone(&item),
                                            timeout,
                                        };
                                        self.pending.lock().insert(next_tag, entry);
                                    } else {
                                        item.completion().succeed(());
                                    }
                                }
                                Err(error) => {
                                    tracing::debug!(
                                        prod_id = %self.id,
                                        err = %error,
                                        "publish dispatch failed, message stays queued"
                                    );
                                    self.publishes.put_retry(vec![item]);
                                    break Err(LinkError::from(error));
                                }
                            }
                        }
                    }
                }
            }
        };

        // Unwind: everything dispatched but unconfirmed goes back to the
        // head of the publish queue, in tag order, for the next generation.
        let restage: Vec<PublishItem> = {
            let mut pending = self.pending.lock();
            pending.drain_in_order().into_iter().map(|entry| entry.item).collect()
        };
        if !restage.is_empty() {
            tracing::debug!(
                prod_id = %self.id,
                count = restage.len(),
                generation = ctx.generation,
                "restaging unconfirmed publishes"
            );
            self.publishes.put_retry(restage);
        }
        outcome
    }

    fn on_ack(&self, delivery_tag: u64, multiple: bool) {
        self.enqueue_confirm(ConfirmEvent::Ack { delivery_tag, multiple });
    }

    fn on_nack(&self, delivery_tag: u64, multiple: bool) {
        self.enqueue_confirm(ConfirmEvent::Nack { delivery_tag, multiple });
    }

    fn on_return(&self, returned: ReturnedPublish) {
        self.enqueue_confirm(ConfirmEvent::Return {
            message_id: returned.properties.message_id,
            reply_code: returned.reply_code,
            reply_text: returned.reply_text,
        });
    }

    fn on_disposed(&self) {
        self.shut_down(LinkError::Disposed);
    }
}

fn clear_timeout(timeouts: &mut DelayQueue<u64>, entry: &PendingEntry) {
    if let Some(key) = &entry.timeout {
        timeouts.try_remove(key);
    }
}

/// Disposable publishing handle bound to one channel.
pub struct Producer {
    core: Arc<ProducerCore>,
    channel: Arc<ChannelSupervisor>,
    config: Arc<LinkConfig>,
    confirm_mode: bool,
}

impl Producer {
    pub(crate) fn start(
        config: Arc<LinkConfig>,
        confirm_mode: bool,
        topology: Option<ConfigureFn>,
        blocked: watch::Receiver<bool>,
        channel_factory: impl FnOnce(Arc<ProducerCore>) -> Arc<ChannelSupervisor>,
    ) -> Self {
        let core = ProducerCore::new(Arc::clone(&config), confirm_mode, topology, blocked);
        let channel = channel_factory(Arc::clone(&core));
        Self { core, channel, config, confirm_mode }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    /// Number of dispatched-but-unconfirmed messages.
    pub fn pending_confirms(&self) -> usize {
        self.core.pending.lock().len()
    }

    /// Publish a message and await its outcome.
    ///
    /// Resolves after the broker's positive confirm (confirm mode) or after
    /// dispatch (confirm mode off). Fails Nacked, Returned, PublishTimeout,
    /// Canceled (cancellation before dispatch) or Disposed.
    pub async fn publish(
        &self,
        message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<(), LinkError> {
        self.publish_deferred(message, cancel).await?.await
    }

    /// Enqueue a publish and return the confirm promise without awaiting it.
    ///
    /// Blocks only for backpressure: above the configured queue ceiling the
    /// call suspends until the pump catches up or `cancel` fires.
    pub async fn publish_deferred(
        &self,
        mut message: OutboundMessage,
        cancel: &CancellationToken,
    ) -> Result<crate::work_item::PromiseFuture<()>, LinkError> {
        if self.core.dispose.is_cancelled() {
            return Err(LinkError::Disposed);
        }
        if message.properties.app_id.is_none() {
            message.properties.app_id = Some(self.config.app_id.clone());
        }
        if self.confirm_mode && message.properties.message_id.is_none() {
            // Returns are matched by message id; make sure there is one.
            message.properties.message_id =
                Some(uuid::Uuid::new_v4().simple().to_string());
        }
        self.core.publishes.wait_below(self.config.publish_queue_ceiling, cancel).await?;
        let (item, future) = WorkItem::new(PumpJob::Publish(message), cancel.clone());
        self.core.publishes.put(item);
        Ok(future)
    }

    /// Dispose the producer: fail queued and pending publishes, close the
    /// channel.
    pub async fn dispose(&self) {
        self.channel.dispose().await;
    }
}

#[cfg(test)]
#[path = "producer_tests.rs"]
mod tests;
