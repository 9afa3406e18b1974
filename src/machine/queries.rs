//! Read-only queries over a queue state.
//!
//! Queries never mutate; they can be evaluated against the live state on
//! any replica or against a restored snapshot.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::machine::consumer::{Consumer, ConsumerIdent, ConsumerStatus};
use crate::machine::dlx::DeadLetterReason;
use crate::machine::effect::{Effect, MonitorTarget};
use crate::machine::message::MsgRef;
use crate::machine::state::QueueState;
use crate::types::{ConsumerKey, LogIndex, Pid};

/// Aggregate counters for the management surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overview {
    pub name: String,
    pub messages_ready: u64,
    pub messages_total: u64,
    pub messages_checked_out: u64,
    pub num_consumers: usize,
    pub num_waiting_consumers: usize,
    pub num_enqueuers: usize,
    pub dead_lettered: u64,
    pub smallest_live_index: Option<LogIndex>,
}

/// Dead-letter sidecar counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlxStats {
    pub count: u64,
    pub msg_bytes: u64,
    pub by_reason: BTreeMap<DeadLetterReason, u64>,
}

impl QueueState {
    /// Messages ready for delivery (returned + first-time).
    pub fn messages_ready(&self) -> u64 {
        (self.messages.len() + self.returns.len()) as u64
    }

    /// All live messages: ready + checked out + dead-lettered.
    pub fn messages_total(&self) -> u64 {
        self.messages_total
    }

    /// Messages delivered but not yet settled, across all consumers.
    pub fn messages_checked_out(&self) -> u64 {
        self.consumers
            .values()
            .map(|c| c.checked_out.len() as u64)
            .sum()
    }

    /// Checked-out count for one consumer.
    pub fn consumer_checked_out(&self, key: ConsumerKey) -> Option<usize> {
        self.consumers.get(&key).map(|c| c.checked_out.len())
    }

    /// A registered consumer by key.
    pub fn consumer(&self, key: ConsumerKey) -> Option<&Consumer> {
        self.consumers.get(&key)
    }

    /// Number of registered (non-waiting) consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Every process known to the queue: consumers, waiting consumers
    /// and publishers, deduplicated.
    pub fn processes(&self) -> Vec<Pid> {
        let pids: BTreeSet<Pid> = self
            .consumers
            .values()
            .map(|c| c.cfg.ident.pid.clone())
            .chain(
                self.waiting_consumers
                    .iter()
                    .map(|(_, c)| c.cfg.ident.pid.clone()),
            )
            .chain(self.enqueuers.keys().cloned())
            .collect();
        pids.into_iter().collect()
    }

    /// Consumers waiting for the single-active slot, in activation order.
    pub fn waiting_consumers(&self) -> &[(ConsumerKey, Consumer)] {
        &self.waiting_consumers
    }

    /// Identity of the active consumer under single-active, if any.
    pub fn single_active_consumer(&self) -> Option<&ConsumerIdent> {
        if !self.cfg.single_active() {
            return None;
        }
        self.consumers
            .values()
            .find(|c| matches!(c.status, ConsumerStatus::Up | ConsumerStatus::Fading))
            .map(|c| &c.cfg.ident)
    }

    /// The message at ready position `pos` (0 = next to deliver). The
    /// body is fetched from the log at the returned reference's index.
    pub fn peek(&self, pos: u64) -> Result<MsgRef> {
        self.returns
            .iter()
            .chain(self.messages.iter())
            .nth(pos as usize)
            .copied()
            .ok_or(Error::NoMessageAtPos(pos))
    }

    /// Smallest log index still referenced by a live message.
    pub fn smallest_live_index(&self) -> Option<LogIndex> {
        self.live_indexes.smallest()
    }

    /// Whether the queue holds no live messages.
    pub fn is_empty(&self) -> bool {
        self.messages_total == 0
    }

    /// Number of registered publishers.
    pub fn enqueuer_count(&self) -> usize {
        self.enqueuers.len()
    }

    /// The state shape version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Dead-letter sidecar counters.
    pub fn dlx_stats(&self) -> DlxStats {
        DlxStats {
            count: self.dlx.count(),
            msg_bytes: self.dlx.msg_bytes(),
            by_reason: self.dlx.stats(),
        }
    }

    /// Aggregate counters for the management surface.
    pub fn overview(&self) -> Overview {
        Overview {
            name: self.cfg.name.clone(),
            messages_ready: self.messages_ready(),
            messages_total: self.messages_total,
            messages_checked_out: self.messages_checked_out(),
            num_consumers: self.consumers.len(),
            num_waiting_consumers: self.waiting_consumers.len(),
            num_enqueuers: self.enqueuers.len(),
            dead_lettered: self.dlx.count(),
            smallest_live_index: self.live_indexes.smallest(),
        }
    }

    /// Effects the substrate fires when this replica becomes leader:
    /// the configured leader callback plus fresh monitors for every
    /// known process (monitors do not survive leader changes).
    pub fn leader_effects(&self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some((module, function)) = &self.cfg.become_leader_handler {
            effects.push(Effect::ModCall {
                module: module.clone(),
                function: function.clone(),
                args: vec![self.cfg.resource.clone()],
            });
        }
        for pid in self.processes() {
            effects.push(Effect::Monitor(MonitorTarget::Process(pid)));
        }
        effects
    }
}
