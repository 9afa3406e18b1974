//! Consumer registry types and credit accounting.
//!
//! A consumer is registered by a checkout command, keyed by the log index
//! it first attached at, and serviced from the [`ServiceQueue`] while it
//! is up and holds credit.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::machine::message::CheckedMsg;
use crate::types::{ConsumerKey, MsgId, Pid};

/// How a consumer's credit is replenished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditMode {
    /// Credit protocol v1: credit refills automatically up to `max`
    /// whenever the consumer settles, returns or requeues.
    SimplePrefetch { max: u32 },
    /// Credit protocol v2: the consumer grants credit explicitly against
    /// its own delivery count; nothing refills automatically.
    Credited { initial_delivery_count: u32 },
}

/// Whether the consumer outlives an empty checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerLifetime {
    /// Detach once its checked-out set empties after a cancel.
    Once,
    /// Stay attached until cancelled or removed.
    #[default]
    Auto,
}

/// Lifecycle status of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStatus {
    /// Eligible for deliveries.
    #[default]
    Up,
    /// Its node lost connectivity; not serviced until `nodeup`.
    SuspectedDown,
    /// Cancelled but retained until its checked-out set empties.
    Cancelled,
    /// Single-active consumer being preempted: receives nothing new,
    /// drains its checked-out set, then moves to the waiting list.
    Fading,
    /// Held its checked-out messages past the consumer lock; reactivated
    /// by settle, return or defer.
    TimedOut,
}

/// Identity a client attaches with; resolved to a [`ConsumerKey`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerIdent {
    /// Client-chosen consumer tag.
    pub tag: String,
    /// Consumer process.
    pub pid: Pid,
}

impl ConsumerIdent {
    /// Create a consumer identity.
    pub fn new(tag: impl Into<String>, pid: Pid) -> Self {
        ConsumerIdent {
            tag: tag.into(),
            pid,
        }
    }
}

/// Static per-consumer configuration fixed at attach time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerCfg {
    /// Tag and pid the consumer attached with.
    pub ident: ConsumerIdent,
    /// Detach discipline.
    pub lifetime: ConsumerLifetime,
    /// Credit protocol.
    pub credit_mode: CreditMode,
    /// Delivery priority; higher is served first.
    pub priority: u8,
    /// Opaque client metadata.
    pub meta: BTreeMap<String, String>,
}

/// A registered consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    /// Attach-time configuration.
    pub cfg: ConsumerCfg,
    /// Remaining deliveries the consumer will accept.
    pub credit: u32,
    /// Deliveries made to this consumer, wrapping mod 2^32 (credit v2).
    pub delivery_count: u32,
    /// Next message id to assign.
    pub next_msg_id: MsgId,
    /// Delivered but unsettled messages by id.
    pub checked_out: BTreeMap<MsgId, CheckedMsg>,
    /// Lifecycle status.
    pub status: ConsumerStatus,
}

impl Consumer {
    /// Register a consumer with its mode's initial credit.
    pub fn new(cfg: ConsumerCfg) -> Self {
        let (credit, delivery_count) = match cfg.credit_mode {
            CreditMode::SimplePrefetch { max } => (max, 0),
            CreditMode::Credited {
                initial_delivery_count,
            } => (0, initial_delivery_count),
        };
        Consumer {
            cfg,
            credit,
            delivery_count,
            next_msg_id: MsgId::new(0),
            checked_out: BTreeMap::new(),
            status: ConsumerStatus::Up,
        }
    }

    /// Whether the checkout engine may deliver to this consumer now.
    #[inline]
    pub fn is_serviceable(&self) -> bool {
        self.status == ConsumerStatus::Up && self.credit > 0
    }

    /// Whether this consumer counts as active for queue-expiry purposes.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            ConsumerStatus::Up | ConsumerStatus::Fading | ConsumerStatus::TimedOut
        )
    }

    /// Sum of checked-out payload sizes.
    pub fn checked_out_bytes(&self) -> u64 {
        self.checked_out.values().map(|c| c.msg.size()).sum()
    }

    /// Refill credit after settlement, per protocol v1. Credit v2
    /// consumers only gain credit through explicit credit commands.
    pub fn replenish_credit(&mut self, settled: u32) {
        if let CreditMode::SimplePrefetch { max } = self.cfg.credit_mode {
            self.credit = self.credit.saturating_add(settled).min(max);
        }
    }
}

/// Compute the credit a sender may still use under protocol v2.
///
/// AMQP serial-number arithmetic: the receiver granted
/// `receiver_credit` deliveries on top of the delivery count it had
/// observed; whatever the sender has delivered since is subtracted and
/// the result clamps at zero.
pub fn link_credit(
    receiver_delivery_count: u32,
    receiver_credit: u32,
    sender_delivery_count: u32,
) -> u32 {
    let diff = receiver_delivery_count
        .wrapping_add(receiver_credit)
        .wrapping_sub(sender_delivery_count);
    // a difference in the upper half of the serial space is a negative
    // number: the grant is already exhausted
    if diff > u32::MAX / 2 { 0 } else { diff }
}

/// Queue of consumers awaiting service.
///
/// Orders by priority (descending), FIFO within a priority. Keys are
/// deduplicated; pushing an enqueued key is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceQueue {
    queues: BTreeMap<u8, VecDeque<ConsumerKey>>,
    enqueued: BTreeSet<ConsumerKey>,
}

impl ServiceQueue {
    /// Create an empty service queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a consumer at the given priority.
    pub fn push(&mut self, key: ConsumerKey, priority: u8) {
        if self.enqueued.insert(key) {
            self.queues.entry(priority).or_default().push_back(key);
        }
    }

    /// Pop the next consumer: highest priority first, FIFO within.
    pub fn pop(&mut self) -> Option<ConsumerKey> {
        let (&priority, _) = self.queues.iter().next_back()?;
        let queue = self.queues.get_mut(&priority)?;
        let key = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(&priority);
        }
        self.enqueued.remove(&key);
        Some(key)
    }

    /// Drop a consumer from the queue wherever it sits.
    pub fn remove(&mut self, key: ConsumerKey) {
        if self.enqueued.remove(&key) {
            for queue in self.queues.values_mut() {
                queue.retain(|k| *k != key);
            }
            self.queues.retain(|_, queue| !queue.is_empty());
        }
    }

    /// Whether the consumer is queued for service.
    pub fn contains(&self, key: ConsumerKey) -> bool {
        self.enqueued.contains(&key)
    }

    /// Whether no consumer awaits service.
    pub fn is_empty(&self) -> bool {
        self.enqueued.is_empty()
    }

    /// Number of queued consumers.
    pub fn len(&self) -> usize {
        self.enqueued.len()
    }
}
