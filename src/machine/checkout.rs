//! The checkout engine.
//!
//! Runs after every command: expires TTL'd messages at the head of the
//! queue, then pairs ready messages with ready consumers until one side
//! runs out, accumulating deliveries per consumer and emitting them as
//! chunked effects.

use std::collections::BTreeMap;

use bytes::Bytes;
use crate::constants::DELIVERY_CHUNK_BYTES;
use crate::machine::command::Meta;
use crate::machine::dlx::DeadLetterReason;
use crate::machine::effect::{DeliveryPlan, Effect, InlineDelivery, OutboundMsg, TimerName};
use crate::machine::message::{CheckedMsg, MsgRef};
use crate::machine::state::QueueState;
use crate::types::{ConsumerKey, LogIndex, MsgId, Pid};

impl QueueState {
    /// Drain ready messages to ready consumers.
    pub(crate) fn checkout(&mut self, meta: &Meta, effects: &mut Vec<Effect>) {
        self.expire_head_msgs(meta, effects);

        let mut batches: BTreeMap<ConsumerKey, Vec<(MsgId, MsgRef)>> = BTreeMap::new();
        while !(self.returns.is_empty() && self.messages.is_empty()) {
            let Some(key) = self.next_serviceable_consumer() else {
                break;
            };
            let Some(msg) = self.take_next() else {
                break;
            };
            let Some(consumer) = self.consumers.get_mut(&key) else {
                break;
            };
            let msg_id = consumer.next_msg_id;
            consumer.next_msg_id = msg_id.next();
            consumer
                .checked_out
                .insert(msg_id, CheckedMsg::new(meta.system_time, msg));
            consumer.credit -= 1;
            consumer.delivery_count = consumer.delivery_count.wrapping_add(1);
            let priority = consumer.cfg.priority;
            let serviceable = consumer.is_serviceable();
            self.msg_bytes_enqueue -= msg.size();
            self.msg_bytes_checkout += msg.size();
            if serviceable {
                self.service_queue.push(key, priority);
            }
            batches.entry(key).or_default().push((msg_id, msg));
        }

        self.emit_deliveries(batches, effects);
        // the cached body is only valid within the command that set it
        self.msg_cache = None;
    }

    /// Pop consumers off the service queue until one can actually take a
    /// message. Stale entries (gone, down, drained of credit) are
    /// dropped on the way.
    fn next_serviceable_consumer(&mut self) -> Option<ConsumerKey> {
        loop {
            let key = self.service_queue.pop()?;
            if self
                .consumers
                .get(&key)
                .is_some_and(|c| c.is_serviceable())
            {
                return Some(key);
            }
        }
    }

    /// Dead-letter expired messages from the head of the queue.
    pub(crate) fn expire_head_msgs(&mut self, meta: &Meta, effects: &mut Vec<Effect>) {
        loop {
            if self
                .returns
                .front()
                .is_some_and(|m| m.header.is_expired(meta.system_time))
            {
                if let Some(msg) = self.returns.pop_front() {
                    self.msg_bytes_enqueue -= msg.size();
                    self.dead_letter(DeadLetterReason::Expired, vec![msg], effects);
                }
                continue;
            }
            if self.returns.is_empty()
                && self
                    .messages
                    .front()
                    .is_some_and(|m| m.header.is_expired(meta.system_time))
            {
                if let Some(msg) = self.messages.pop_front() {
                    self.msg_bytes_enqueue -= msg.size();
                    self.dead_letter(DeadLetterReason::Expired, vec![msg], effects);
                }
                continue;
            }
            break;
        }
    }

    /// Arm the expiry timer for the soonest head expiry. `cancel_idle`
    /// makes an explicit cancellation when nothing is due (the periodic
    /// tick uses it so a drained queue stops ticking).
    pub(crate) fn arm_expiry_timer(
        &self,
        meta: &Meta,
        cancel_idle: bool,
        effects: &mut Vec<Effect>,
    ) {
        let soonest = self
            .returns
            .front()
            .and_then(|m| m.header.expiry())
            .into_iter()
            .chain(self.messages.front().and_then(|m| m.header.expiry()))
            .min();
        match soonest {
            Some(expiry) => effects.push(Effect::Timer {
                name: TimerName::ExpireMsgs,
                delay_ms: Some(expiry.saturating_sub(meta.system_time)),
            }),
            None if cancel_idle => effects.push(Effect::Timer {
                name: TimerName::ExpireMsgs,
                delay_ms: None,
            }),
            None => {}
        }
    }

    /// Emit delivery effects, one consumer at a time, chunked so no
    /// single effect carries an unbounded batch.
    fn emit_deliveries(
        &mut self,
        batches: BTreeMap<ConsumerKey, Vec<(MsgId, MsgRef)>>,
        effects: &mut Vec<Effect>,
    ) {
        let msg_cache = self.msg_cache.take();
        for (key, msgs) in batches {
            let Some(consumer) = self.consumers.get(&key) else {
                continue;
            };
            let pid = consumer.cfg.ident.pid.clone();
            let tag = consumer.cfg.ident.tag.clone();
            let mut chunk: Vec<(MsgId, MsgRef)> = Vec::new();
            let mut chunk_bytes = 0u64;
            for (msg_id, msg) in msgs {
                if !chunk.is_empty() && chunk_bytes + msg.size() > DELIVERY_CHUNK_BYTES {
                    push_delivery(&pid, &tag, std::mem::take(&mut chunk), &msg_cache, effects);
                    chunk_bytes = 0;
                }
                chunk_bytes += msg.size();
                chunk.push((msg_id, msg));
            }
            if !chunk.is_empty() {
                push_delivery(&pid, &tag, chunk, &msg_cache, effects);
            }
        }
    }
}

/// A single-message batch whose body was enqueued by the current command
/// is sent inline; everything else goes through a log read.
fn push_delivery(
    pid: &Pid,
    tag: &str,
    msgs: Vec<(MsgId, MsgRef)>,
    msg_cache: &Option<(LogIndex, Bytes)>,
    effects: &mut Vec<Effect>,
) {
    if let [(msg_id, msg)] = msgs[..] {
        if let Some((cached_index, body)) = msg_cache {
            if msg.index == *cached_index {
                effects.push(Effect::SendMsg {
                    pid: pid.clone(),
                    msg: OutboundMsg::Delivery {
                        tag: tag.to_string(),
                        msgs: vec![InlineDelivery {
                            msg_id,
                            msg,
                            body: body.clone(),
                        }],
                    },
                });
                return;
            }
        }
    }
    effects.push(Effect::LogRead {
        plan: DeliveryPlan {
            pid: pid.clone(),
            tag: tag.to_string(),
            msgs,
        },
    });
}
