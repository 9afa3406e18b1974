//! The queue state machine.
//!
//! [`QueueState::apply`] is a pure function of `(meta, command, state)`:
//! it mutates the state in place and returns the caller's reply plus the
//! side-effects the replication substrate must execute. No handler reads
//! a clock, randomness or process state; every replica applying the same
//! command log converges on identical state.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::constants::RELEASE_CURSOR_INTERVAL_MAX;
use crate::error::Error;
use crate::machine::command::{
    CheckoutReply, CheckoutSpec, Command, ConsumerRef, CreditReply, DequeueReply, DownReason, Meta,
    Reply, Settlement,
};
use crate::machine::config::{Config, ConfigUpdate, DeadLetterHandler, OverflowStrategy};
use crate::machine::consumer::{
    link_credit, Consumer, ConsumerCfg, ConsumerIdent, ConsumerLifetime, ConsumerStatus,
    CreditMode, ServiceQueue,
};
use crate::machine::dlx::{DeadLetterReason, DlxCommand, DlxState};
use crate::machine::effect::{AuxRequest, Effect, MonitorTarget, OutboundMsg, QueueStatus};
use crate::machine::enqueuer::{Enqueuer, EnqueuerStatus, SeqnoOutcome};
use crate::machine::indexes::LiveIndexes;
use crate::machine::message::{Header, MsgRef};
use crate::types::{ConsumerKey, LogIndex, MsgId, NodeId, Pid};

/// A staged snapshot awaiting emission.
///
/// Held until the smallest live log index advances past `index`, at
/// which point the substrate may truncate its log up to `index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseCursor {
    pub index: LogIndex,
    pub state: Box<QueueState>,
}

/// Per-queue replicated state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    /// Static-per-version configuration.
    pub cfg: Config,
    /// State shape version, for rolling upgrades.
    pub(crate) version: u8,
    /// Ready messages in FIFO order.
    pub(crate) messages: VecDeque<MsgRef>,
    /// Returned messages; drained before `messages`.
    pub(crate) returns: VecDeque<MsgRef>,
    /// Log indexes still referenced by live messages.
    pub(crate) live_indexes: LiveIndexes,
    /// All live messages: ready + returned + checked out + dead-lettered.
    pub(crate) messages_total: u64,
    /// Bytes of ready + returned messages.
    pub(crate) msg_bytes_enqueue: u64,
    /// Bytes of checked-out messages.
    pub(crate) msg_bytes_checkout: u64,
    /// Enqueues since the last staged release cursor.
    pub(crate) enqueue_count: u64,
    /// Tracked publishers.
    pub(crate) enqueuers: BTreeMap<Pid, Enqueuer>,
    /// Registered consumers by canonical key.
    pub(crate) consumers: BTreeMap<ConsumerKey, Consumer>,
    /// Consumers awaiting service (up, positive credit).
    pub(crate) service_queue: ServiceQueue,
    /// Single-active mode: consumers waiting for the active slot, kept
    /// sorted by (priority desc, credit desc, key asc).
    pub(crate) waiting_consumers: Vec<(ConsumerKey, Consumer)>,
    /// Staged snapshots awaiting emission.
    pub(crate) release_cursors: VecDeque<ReleaseCursor>,
    /// Dead-letter sidecar.
    pub(crate) dlx: DlxState,
    /// System time of the last non-idle activity.
    pub(crate) last_active: u64,
    /// Body of the message enqueued by the current command, kept when it
    /// can be delivered immediately without a log fetch.
    pub(crate) msg_cache: Option<(LogIndex, Bytes)>,
}

impl QueueState {
    /// Create a fresh state for the given configuration.
    pub fn new(cfg: Config) -> Self {
        QueueState {
            cfg,
            version: crate::constants::MACHINE_VERSION,
            messages: VecDeque::new(),
            returns: VecDeque::new(),
            live_indexes: LiveIndexes::new(),
            messages_total: 0,
            msg_bytes_enqueue: 0,
            msg_bytes_checkout: 0,
            enqueue_count: 0,
            enqueuers: BTreeMap::new(),
            consumers: BTreeMap::new(),
            service_queue: ServiceQueue::new(),
            waiting_consumers: Vec::new(),
            release_cursors: VecDeque::new(),
            dlx: DlxState::new(),
            last_active: 0,
            msg_cache: None,
        }
    }

    /// Apply a command, producing the reply and side-effects.
    pub fn apply(&mut self, meta: &Meta, command: Command) -> (Reply, Vec<Effect>) {
        let mut effects = Vec::new();
        let was_live = !self.live_indexes.is_empty();
        let enqueued = matches!(
            command,
            Command::Enqueue { .. } | Command::EnqueueCompact { .. }
        );
        let is_tick = matches!(command, Command::ExpireMsgs);

        let reply = match command {
            Command::Enqueue {
                pid,
                seq,
                payload,
                ttl_ms,
            } => self.handle_enqueue(meta, pid, seq, payload, ttl_ms, &mut effects),

            Command::EnqueueCompact {
                seq,
                payload,
                ttl_ms,
            } => {
                let pid = meta.notify_pid().cloned();
                let seq = pid.is_some().then_some(seq);
                self.handle_enqueue(meta, pid, seq, payload, ttl_ms, &mut effects)
            }

            Command::RegisterEnqueuer { pid } => {
                self.register_enqueuer(&pid, &mut effects);
                self.last_active = meta.system_time;
                Reply::Ok
            }

            Command::Checkout {
                consumer,
                spec,
                priority,
                meta: consumer_meta,
            } => self.handle_checkout(meta, consumer, spec, priority, consumer_meta, &mut effects),

            Command::Settle { consumer, msg_ids } => {
                self.handle_settle(meta, consumer, msg_ids, &mut effects)
            }

            Command::Return { consumer, msg_ids } => {
                self.handle_return(meta, consumer, msg_ids, &mut effects)
            }

            Command::Discard { consumer, msg_ids } => {
                self.handle_discard(meta, consumer, msg_ids, &mut effects)
            }

            Command::Defer { consumer, msg_ids } => self.handle_defer(meta, consumer, msg_ids),

            Command::Credit {
                consumer,
                credit,
                delivery_count,
                drain,
            } => self.handle_credit(meta, consumer, credit, delivery_count, drain, &mut effects),

            Command::Requeue {
                consumer,
                msg_id,
                payload,
            } => self.handle_requeue(meta, consumer, msg_id, payload, &mut effects),

            Command::Purge => self.handle_purge(meta),

            Command::PurgeNodes { nodes } => {
                for node in nodes {
                    self.forget_node(meta, &node, &mut effects);
                }
                Reply::Ok
            }

            Command::UpdateConfig { update } => {
                self.handle_update_config(update, &mut effects);
                Reply::Ok
            }

            Command::GarbageCollection => {
                effects.push(Effect::Aux(AuxRequest::GarbageCollection));
                Reply::Ok
            }

            Command::EvalConsumerTimeouts { keys } => {
                self.eval_consumer_timeouts(meta, &keys);
                self.check_queue_expiry(meta, &mut effects);
                Reply::Ok
            }

            Command::ExpireMsgs => {
                self.check_queue_expiry(meta, &mut effects);
                Reply::Ok
            }

            Command::Down { pid, reason } => {
                self.handle_down(meta, pid, reason, &mut effects);
                Reply::Ok
            }

            Command::NodeUp { node } => {
                self.handle_node_up(meta, &node, &mut effects);
                Reply::Ok
            }

            Command::NodeDown { node } => {
                effects.push(Effect::Monitor(MonitorTarget::Node(node)));
                Reply::Ok
            }

            Command::UpgradeMachine { from, to } => {
                self.upgrade_machine(meta, from, to);
                Reply::Ok
            }

            Command::Dlx(cmd) => self.handle_dlx(meta, cmd, &mut effects),

            Command::Noop => Reply::Ok,
        };

        self.evaluate_single_active(&mut effects);
        self.checkout(meta, &mut effects);
        self.enforce_limits(meta, &mut effects);
        self.arm_expiry_timer(meta, is_tick, &mut effects);
        if enqueued {
            self.stage_release_cursor(meta);
        }
        self.maybe_emit_release_cursor(meta, was_live, &mut effects);
        self.assert_invariants();

        (reply, effects)
    }

    // ========================================================================
    // Enqueue pipeline
    // ========================================================================

    fn handle_enqueue(
        &mut self,
        meta: &Meta,
        pid: Option<Pid>,
        seq: Option<u64>,
        payload: Bytes,
        ttl_ms: Option<u64>,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        match (pid, seq) {
            (Some(pid), Some(seq)) => {
                self.register_enqueuer(&pid, effects);
                let outcome = match self.enqueuers.get_mut(&pid) {
                    Some(enqueuer) => enqueuer.gate_seqno(seq),
                    None => SeqnoOutcome::Accept,
                };
                match outcome {
                    SeqnoOutcome::Accept => {
                        self.append(meta, payload, ttl_ms);
                        Reply::Ok
                    }
                    SeqnoOutcome::OutOfSequence { expected } => {
                        tracing::debug!(
                            publisher = %pid,
                            seq,
                            expected,
                            "enqueue ahead of expected sequence"
                        );
                        Reply::Error(Error::NotEnqueued { expected })
                    }
                    // a replayed sequence number is dropped silently
                    SeqnoOutcome::Duplicate => Reply::Ok,
                }
            }
            // untracked enqueues are appended unconditionally
            _ => {
                self.append(meta, payload, ttl_ms);
                Reply::Ok
            }
        }
    }

    fn register_enqueuer(&mut self, pid: &Pid, effects: &mut Vec<Effect>) {
        if !self.enqueuers.contains_key(pid) {
            self.enqueuers
                .insert(pid.clone(), Enqueuer::new(pid.clone()));
            effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
        }
    }

    fn append(&mut self, meta: &Meta, payload: Bytes, ttl_ms: Option<u64>) {
        let size = payload.len() as u64;
        let ttl = match (ttl_ms, self.cfg.msg_ttl) {
            (Some(per_msg), Some(queue)) => Some(per_msg.min(queue)),
            (Some(per_msg), None) => Some(per_msg),
            (None, queue) => queue,
        };
        // ttl 0 means "consume within this millisecond"
        let expiry = ttl.map(|t| {
            if t == 0 {
                meta.system_time + 1
            } else {
                meta.system_time + t
            }
        });
        let header = Header::new(size, expiry, 0);
        // an empty queue with a waiting consumer can take this message
        // without a log fetch
        if self.messages.is_empty() && self.returns.is_empty() && !self.service_queue.is_empty() {
            self.msg_cache = Some((meta.index, payload));
        }
        self.messages.push_back(MsgRef::new(meta.index, header));
        self.live_indexes.insert(meta.index);
        self.messages_total += 1;
        self.msg_bytes_enqueue += size;
        self.enqueue_count += 1;
        self.last_active = meta.system_time;
    }

    // ========================================================================
    // Checkout command (attach / dequeue / cancel / remove)
    // ========================================================================

    fn handle_checkout(
        &mut self,
        meta: &Meta,
        ident: ConsumerIdent,
        spec: CheckoutSpec,
        priority: u8,
        consumer_meta: BTreeMap<String, String>,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        self.last_active = meta.system_time;
        match spec {
            CheckoutSpec::Attach {
                lifetime,
                credit_mode,
            } => self.attach_consumer(
                meta,
                ConsumerCfg {
                    ident,
                    lifetime,
                    credit_mode,
                    priority,
                    meta: consumer_meta,
                },
                effects,
            ),
            CheckoutSpec::Dequeue(settlement) => self.dequeue(meta, ident, settlement, effects),
            CheckoutSpec::Cancel => self.cancel_consumer(&ident, effects),
            CheckoutSpec::Remove => self.remove_consumer(&ident, effects),
        }
    }

    fn attach_consumer(
        &mut self,
        meta: &Meta,
        cfg: ConsumerCfg,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        // re-attach of a known consumer merges into the existing entry
        if let Some(key) = self.find_key_by_ident(&cfg.ident) {
            return self.merge_consumer(key, cfg);
        }

        let key = ConsumerKey::from(meta.index);
        let consumer = Consumer::new(cfg);
        effects.push(Effect::Monitor(MonitorTarget::Process(
            consumer.cfg.ident.pid.clone(),
        )));

        if self.cfg.single_active() && self.active_consumer().is_some() {
            let reply = Reply::Checkout(CheckoutReply {
                key,
                credit: consumer.credit,
                delivery_count: consumer.delivery_count,
                num_checked_out: 0,
                active: false,
            });
            self.insert_waiting(key, consumer);
            return reply;
        }

        if self.cfg.single_active() {
            effects.push(Effect::SendMsg {
                pid: consumer.cfg.ident.pid.clone(),
                msg: OutboundMsg::ConsumerUpdate {
                    tag: consumer.cfg.ident.tag.clone(),
                    active: true,
                    single_active: true,
                },
            });
        }
        if consumer.is_serviceable() {
            self.service_queue.push(key, consumer.cfg.priority);
        }
        let reply = Reply::Checkout(CheckoutReply {
            key,
            credit: consumer.credit,
            delivery_count: consumer.delivery_count,
            num_checked_out: 0,
            active: true,
        });
        self.consumers.insert(key, consumer);
        reply
    }

    fn merge_consumer(&mut self, key: ConsumerKey, cfg: ConsumerCfg) -> Reply {
        if let Some(consumer) = self.consumers.get_mut(&key) {
            consumer.cfg = cfg;
            consumer.status = ConsumerStatus::Up;
            if let CreditMode::SimplePrefetch { max } = consumer.cfg.credit_mode {
                consumer.credit = max.saturating_sub(consumer.checked_out.len() as u32);
            }
            let reply = Reply::Checkout(CheckoutReply {
                key,
                credit: consumer.credit,
                delivery_count: consumer.delivery_count,
                num_checked_out: consumer.checked_out.len(),
                active: true,
            });
            let priority = consumer.cfg.priority;
            if consumer.is_serviceable() {
                self.service_queue.push(key, priority);
            }
            reply
        } else if let Some(pos) = self
            .waiting_consumers
            .iter()
            .position(|(waiting_key, _)| *waiting_key == key)
        {
            let (_, consumer) = &mut self.waiting_consumers[pos];
            consumer.cfg = cfg;
            consumer.status = ConsumerStatus::Up;
            let reply = Reply::Checkout(CheckoutReply {
                key,
                credit: consumer.credit,
                delivery_count: consumer.delivery_count,
                num_checked_out: consumer.checked_out.len(),
                active: false,
            });
            self.sort_waiting();
            reply
        } else {
            Reply::Ok
        }
    }

    fn dequeue(
        &mut self,
        meta: &Meta,
        ident: ConsumerIdent,
        settlement: Settlement,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        if self.cfg.single_active() {
            return Reply::Error(Error::UnsupportedDequeue);
        }
        self.expire_head_msgs(meta, effects);
        if self.messages.is_empty() && self.returns.is_empty() {
            return Reply::Error(Error::DequeueEmpty);
        }

        let key = ConsumerKey::from(meta.index);
        let consumer = Consumer::new(ConsumerCfg {
            ident,
            lifetime: ConsumerLifetime::Once,
            credit_mode: CreditMode::SimplePrefetch { max: 1 },
            priority: 0,
            meta: BTreeMap::new(),
        });
        self.service_queue.push(key, 0);
        self.consumers.insert(key, consumer);
        // the checkout pass performs the single delivery
        self.checkout(meta, effects);

        let drawn = self
            .consumers
            .get(&key)
            .and_then(|c| c.checked_out.iter().next().map(|(id, c)| (*id, c.msg)));
        let Some((msg_id, msg)) = drawn else {
            self.consumers.remove(&key);
            self.service_queue.remove(key);
            return Reply::Error(Error::DequeueEmpty);
        };
        if settlement == Settlement::Settled {
            self.settle_msgs(key, &[msg_id]);
            self.consumers.remove(&key);
        }
        Reply::Dequeue(DequeueReply::Message {
            msg_id,
            msg,
            ready: self.messages_ready(),
        })
    }

    fn cancel_consumer(&mut self, ident: &ConsumerIdent, effects: &mut Vec<Effect>) -> Reply {
        let Some(key) = self.find_key_by_ident(ident) else {
            return Reply::Error(Error::ConsumerNotFound {
                tag: ident.tag.clone(),
                pid: ident.pid.clone(),
            });
        };
        let drained = match self.consumers.get_mut(&key) {
            Some(consumer) => {
                consumer.status = ConsumerStatus::Cancelled;
                consumer.checked_out.is_empty()
            }
            // cancelling a waiting consumer just drops it from the list
            None => {
                self.waiting_consumers.retain(|(k, _)| *k != key);
                return Reply::Ok;
            }
        };
        self.service_queue.remove(key);
        if drained {
            self.delete_consumer(key, effects);
        }
        Reply::Ok
    }

    fn remove_consumer(&mut self, ident: &ConsumerIdent, effects: &mut Vec<Effect>) -> Reply {
        let Some(key) = self.find_key_by_ident(ident) else {
            return Reply::Error(Error::ConsumerNotFound {
                tag: ident.tag.clone(),
                pid: ident.pid.clone(),
            });
        };
        if self.consumers.contains_key(&key) {
            self.return_all(key);
            self.delete_consumer(key, effects);
        } else {
            self.waiting_consumers.retain(|(k, _)| *k != key);
        }
        Reply::Ok
    }

    /// Remove a consumer entirely, demonitoring its pid if nothing else
    /// uses it.
    fn delete_consumer(&mut self, key: ConsumerKey, effects: &mut Vec<Effect>) {
        self.service_queue.remove(key);
        let Some(consumer) = self.consumers.remove(&key) else {
            return;
        };
        let pid = consumer.cfg.ident.pid;
        let still_used = self.enqueuers.contains_key(&pid)
            || self.consumers.values().any(|c| c.cfg.ident.pid == pid)
            || self
                .waiting_consumers
                .iter()
                .any(|(_, c)| c.cfg.ident.pid == pid);
        if !still_used {
            effects.push(Effect::Demonitor(MonitorTarget::Process(pid)));
        }
    }

    // ========================================================================
    // Settlement, return, discard, requeue, defer
    // ========================================================================

    fn handle_settle(
        &mut self,
        meta: &Meta,
        cref: ConsumerRef,
        msg_ids: Vec<MsgId>,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        let Some(key) = self.resolve_consumer_ref(&cref) else {
            return Reply::Error(Error::InvalidConsumerKey(Self::ref_key(&cref)));
        };
        self.last_active = meta.system_time;
        let settled = self.settle_msgs(key, &msg_ids);
        if let Some(consumer) = self.consumers.get_mut(&key) {
            if consumer.cfg.lifetime != ConsumerLifetime::Once {
                consumer.replenish_credit(settled);
            }
        }
        self.reactivate(key);
        self.maybe_detach(key, effects);
        Reply::Ok
    }

    /// Settle the listed ids against a consumer's checked-out set.
    /// Unknown ids are no-ops. Returns the number settled.
    fn settle_msgs(&mut self, key: ConsumerKey, msg_ids: &[MsgId]) -> u32 {
        let mut freed = Vec::new();
        if let Some(consumer) = self.consumers.get_mut(&key) {
            for msg_id in msg_ids {
                if let Some(checked) = consumer.checked_out.remove(msg_id) {
                    freed.push(checked.msg);
                }
            }
        }
        let settled = freed.len() as u32;
        for msg in freed {
            self.msg_bytes_checkout -= msg.size();
            self.live_indexes.remove(msg.index);
            self.messages_total -= 1;
        }
        settled
    }

    fn handle_return(
        &mut self,
        meta: &Meta,
        cref: ConsumerRef,
        msg_ids: Vec<MsgId>,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        let Some(key) = self.resolve_consumer_ref(&cref) else {
            return Reply::Error(Error::InvalidConsumerKey(Self::ref_key(&cref)));
        };
        self.last_active = meta.system_time;
        // returns re-enter the queue in msg-id order
        let ids: BTreeSet<MsgId> = msg_ids.into_iter().collect();
        let mut taken = Vec::new();
        if let Some(consumer) = self.consumers.get_mut(&key) {
            for msg_id in ids {
                if let Some(checked) = consumer.checked_out.remove(&msg_id) {
                    taken.push(checked.msg);
                }
            }
        }
        let returned = taken.len() as u32;
        let mut dead = Vec::new();
        for msg in taken {
            let msg = MsgRef::new(msg.index, msg.header.incr_delivery_count());
            self.msg_bytes_checkout -= msg.size();
            if self
                .cfg
                .delivery_limit
                .is_some_and(|limit| msg.header.delivery_count() > limit)
            {
                dead.push(msg);
            } else {
                self.msg_bytes_enqueue += msg.size();
                self.returns.push_back(msg);
            }
        }
        if !dead.is_empty() {
            tracing::debug!(
                consumer = %key,
                count = dead.len(),
                "delivery limit exceeded, dead-lettering"
            );
            self.dead_letter(DeadLetterReason::DeliveryLimit, dead, effects);
        }
        if let Some(consumer) = self.consumers.get_mut(&key) {
            if consumer.cfg.lifetime != ConsumerLifetime::Once {
                consumer.replenish_credit(returned);
            }
        }
        self.reactivate(key);
        self.maybe_detach(key, effects);
        Reply::Ok
    }

    fn handle_discard(
        &mut self,
        meta: &Meta,
        cref: ConsumerRef,
        msg_ids: Vec<MsgId>,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        let Some(key) = self.resolve_consumer_ref(&cref) else {
            return Reply::Error(Error::InvalidConsumerKey(Self::ref_key(&cref)));
        };
        self.last_active = meta.system_time;
        // the dead-letter order is the order the client discarded in
        let mut discarded = Vec::new();
        if let Some(consumer) = self.consumers.get_mut(&key) {
            for msg_id in &msg_ids {
                if let Some(checked) = consumer.checked_out.remove(msg_id) {
                    discarded.push(checked.msg);
                }
            }
        }
        let count = discarded.len() as u32;
        for msg in &discarded {
            self.msg_bytes_checkout -= msg.size();
        }
        self.dead_letter(DeadLetterReason::Rejected, discarded, effects);
        if let Some(consumer) = self.consumers.get_mut(&key) {
            if consumer.cfg.lifetime != ConsumerLifetime::Once {
                consumer.replenish_credit(count);
            }
        }
        self.reactivate(key);
        self.maybe_detach(key, effects);
        Reply::Ok
    }

    fn handle_requeue(
        &mut self,
        meta: &Meta,
        cref: ConsumerRef,
        msg_id: MsgId,
        payload: Bytes,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        let Some(key) = self.resolve_consumer_ref(&cref) else {
            return Reply::Error(Error::InvalidConsumerKey(Self::ref_key(&cref)));
        };
        self.last_active = meta.system_time;
        let Some(checked) = self
            .consumers
            .get_mut(&key)
            .and_then(|c| c.checked_out.remove(&msg_id))
        else {
            return Reply::Ok;
        };
        let header = checked.msg.header.incr_delivery_count();
        let size = header.size();
        self.msg_bytes_checkout -= size;
        // the message body now lives at this command's own log index
        self.live_indexes.remove(checked.msg.index);
        if self.messages.is_empty() && self.returns.is_empty() && !self.service_queue.is_empty() {
            self.msg_cache = Some((meta.index, payload));
        }
        self.messages.push_back(MsgRef::new(meta.index, header));
        self.live_indexes.insert(meta.index);
        self.msg_bytes_enqueue += size;
        if let Some(consumer) = self.consumers.get_mut(&key) {
            if consumer.cfg.lifetime != ConsumerLifetime::Once {
                consumer.replenish_credit(1);
            }
        }
        self.reactivate(key);
        self.maybe_detach(key, effects);
        Reply::Ok
    }

    fn handle_defer(&mut self, meta: &Meta, cref: ConsumerRef, msg_ids: Vec<MsgId>) -> Reply {
        let Some(key) = self.resolve_consumer_ref(&cref) else {
            return Reply::Error(Error::InvalidConsumerKey(Self::ref_key(&cref)));
        };
        self.last_active = meta.system_time;
        if let Some(consumer) = self.consumers.get_mut(&key) {
            for msg_id in &msg_ids {
                if let Some(checked) = consumer.checked_out.get_mut(msg_id) {
                    checked.deadline = meta.system_time;
                }
            }
        }
        self.reactivate(key);
        Reply::Ok
    }

    /// A settlement-family command brings a timed-out consumer back.
    fn reactivate(&mut self, key: ConsumerKey) {
        let Some(consumer) = self.consumers.get(&key) else {
            return;
        };
        if consumer.status == ConsumerStatus::TimedOut {
            let slot_taken = self.cfg.single_active()
                && self.consumers.iter().any(|(k, c)| {
                    *k != key
                        && matches!(c.status, ConsumerStatus::Up | ConsumerStatus::Fading)
                });
            if slot_taken {
                // the active slot moved on while this consumer was
                // timed out; it drains its remaining deliveries, then
                // joins the waiting list
                if consumer.checked_out.is_empty() {
                    if let Some(mut consumer) = self.consumers.remove(&key) {
                        consumer.status = ConsumerStatus::Up;
                        self.service_queue.remove(key);
                        self.insert_waiting(key, consumer);
                    }
                }
                return;
            }
            if let Some(consumer) = self.consumers.get_mut(&key) {
                consumer.status = ConsumerStatus::Up;
            }
        }
        let Some(consumer) = self.consumers.get(&key) else {
            return;
        };
        let priority = consumer.cfg.priority;
        if consumer.is_serviceable() {
            self.service_queue.push(key, priority);
        }
    }

    /// Drop a cancelled or one-shot consumer once it has drained.
    fn maybe_detach(&mut self, key: ConsumerKey, effects: &mut Vec<Effect>) {
        let done = self.consumers.get(&key).is_some_and(|c| {
            c.checked_out.is_empty()
                && (c.status == ConsumerStatus::Cancelled
                    || (c.cfg.lifetime == ConsumerLifetime::Once && c.credit == 0))
        });
        if done {
            self.delete_consumer(key, effects);
        }
    }

    // ========================================================================
    // Credit
    // ========================================================================

    fn handle_credit(
        &mut self,
        meta: &Meta,
        cref: ConsumerRef,
        credit: u32,
        delivery_count: u32,
        drain: bool,
        effects: &mut Vec<Effect>,
    ) -> Reply {
        self.last_active = meta.system_time;

        // credit for a waiting (inactive) consumer is recorded on the
        // waiting entry; nothing is available to it yet
        if let Some(pos) = self.find_waiting_by_ref(&cref) {
            let (_, consumer) = &mut self.waiting_consumers[pos];
            match consumer.cfg.credit_mode {
                CreditMode::SimplePrefetch { .. } => {
                    consumer.credit = credit;
                    self.sort_waiting();
                    return Reply::Credit(CreditReply {
                        available: 0,
                        drained: None,
                    });
                }
                CreditMode::Credited { .. } => {
                    consumer.credit = link_credit(delivery_count, credit, consumer.delivery_count);
                    let msg = OutboundMsg::CreditReply {
                        tag: consumer.cfg.ident.tag.clone(),
                        delivery_count: consumer.delivery_count,
                        credit: consumer.credit,
                        available: 0,
                        drain,
                    };
                    let pid = consumer.cfg.ident.pid.clone();
                    self.sort_waiting();
                    effects.push(Effect::SendMsg { pid, msg });
                    return Reply::Ok;
                }
            }
        }

        let Some(key) = self.resolve_consumer_ref(&cref) else {
            // credit for unknown consumers is ignored
            return Reply::Ok;
        };
        let Some(mode) = self.consumers.get(&key).map(|c| c.cfg.credit_mode) else {
            return Reply::Ok;
        };

        match mode {
            CreditMode::SimplePrefetch { .. } => {
                let mut drained = None;
                if let Some(consumer) = self.consumers.get_mut(&key) {
                    consumer.credit = credit;
                    if drain {
                        let residual = consumer.credit;
                        consumer.delivery_count = consumer.delivery_count.wrapping_add(residual);
                        consumer.credit = 0;
                        drained = Some(residual);
                    } else if consumer.is_serviceable() {
                        let priority = consumer.cfg.priority;
                        self.service_queue.push(key, priority);
                    }
                }
                self.checkout(meta, effects);
                Reply::Credit(CreditReply {
                    available: self.messages_ready(),
                    drained,
                })
            }
            CreditMode::Credited { .. } => {
                if let Some(consumer) = self.consumers.get_mut(&key) {
                    consumer.credit = link_credit(delivery_count, credit, consumer.delivery_count);
                    if consumer.is_serviceable() {
                        let priority = consumer.cfg.priority;
                        self.service_queue.push(key, priority);
                    }
                }
                // deliveries first so the flow answer follows the
                // transfers on the wire
                self.checkout(meta, effects);
                let available = self.messages_ready();
                if let Some(consumer) = self.consumers.get_mut(&key) {
                    if drain && consumer.credit > 0 {
                        let residual = consumer.credit;
                        consumer.delivery_count = consumer.delivery_count.wrapping_add(residual);
                        consumer.credit = 0;
                    }
                    let msg = OutboundMsg::CreditReply {
                        tag: consumer.cfg.ident.tag.clone(),
                        delivery_count: consumer.delivery_count,
                        credit: consumer.credit,
                        available,
                        drain,
                    };
                    let pid = consumer.cfg.ident.pid.clone();
                    effects.push(Effect::SendMsg { pid, msg });
                }
                Reply::Ok
            }
        }
    }

    // ========================================================================
    // Purge / config / upgrade
    // ========================================================================

    fn handle_purge(&mut self, meta: &Meta) -> Reply {
        self.last_active = meta.system_time;
        let mut count = 0u64;
        let drained: Vec<MsgRef> = self
            .returns
            .drain(..)
            .chain(self.messages.drain(..))
            .collect();
        for msg in drained {
            self.live_indexes.remove(msg.index);
            self.messages_total -= 1;
            self.msg_bytes_enqueue -= msg.size();
            count += 1;
        }
        self.msg_cache = None;
        tracing::debug!(queue = %self.cfg.name, count, "purged ready messages");
        Reply::Purged { count }
    }

    fn handle_update_config(&mut self, update: ConfigUpdate, effects: &mut Vec<Effect>) {
        let was_single_active = self.cfg.single_active();
        self.cfg.update(update);
        if self.cfg.single_active() && !was_single_active {
            // the lowest-keyed up consumer keeps the active slot. Every
            // other registered consumer leaves the registry whatever
            // its status, or a later status flip (nodeup, defer) would
            // hand a second consumer back to the service queue.
            let chosen = self
                .consumers
                .iter()
                .find(|(_, c)| c.status == ConsumerStatus::Up)
                .map(|(k, _)| *k);
            let keys: Vec<ConsumerKey> = self
                .consumers
                .keys()
                .copied()
                .filter(|key| Some(*key) != chosen)
                .collect();
            for key in keys {
                self.return_all(key);
                self.service_queue.remove(key);
                let cancelled = self
                    .consumers
                    .get(&key)
                    .is_some_and(|c| c.status == ConsumerStatus::Cancelled);
                if cancelled {
                    // only retained for its outstanding deliveries,
                    // which just went back to the queue
                    self.delete_consumer(key, effects);
                    continue;
                }
                if let Some(mut consumer) = self.consumers.remove(&key) {
                    if consumer.status == ConsumerStatus::TimedOut {
                        // nothing is checked out anymore; the lock
                        // state is void
                        consumer.status = ConsumerStatus::Up;
                    }
                    self.insert_waiting(key, consumer);
                }
            }
        }
    }

    fn upgrade_machine(&mut self, meta: &Meta, from: u8, to: u8) {
        if from < 4 && to >= 4 {
            // older shapes carried no delivery deadline; stamp now
            for consumer in self.consumers.values_mut() {
                for checked in consumer.checked_out.values_mut() {
                    checked.deadline = meta.system_time;
                }
            }
        }
        let to = to.min(crate::constants::MACHINE_VERSION);
        tracing::info!(queue = %self.cfg.name, from, to, "machine version upgraded");
        self.version = to;
    }

    // ========================================================================
    // Dead-lettering
    // ========================================================================

    /// Hand messages no longer deliverable to the configured dead-letter
    /// path. Callers have already detached them from the queue/consumer
    /// and settled the enqueue/checkout byte accounting.
    pub(crate) fn dead_letter(
        &mut self,
        reason: DeadLetterReason,
        msgs: Vec<MsgRef>,
        effects: &mut Vec<Effect>,
    ) {
        if msgs.is_empty() {
            return;
        }
        match &self.cfg.dead_letter_handler {
            Some(DeadLetterHandler::AtLeastOnce) => {
                // entries stay live: counted, indexed, gating cursors
                self.dlx.discard(reason, msgs);
                self.dlx.deliver(effects);
            }
            Some(DeadLetterHandler::AtMostOnce { module, function }) => {
                let mut args = vec![self.cfg.resource.clone(), reason.to_string()];
                for msg in &msgs {
                    args.push(msg.index.value().to_string());
                }
                effects.push(Effect::ModCall {
                    module: module.clone(),
                    function: function.clone(),
                    args,
                });
                for msg in msgs {
                    self.live_indexes.remove(msg.index);
                    self.messages_total -= 1;
                }
            }
            None => {
                for msg in msgs {
                    self.live_indexes.remove(msg.index);
                    self.messages_total -= 1;
                }
            }
        }
    }

    fn handle_dlx(&mut self, meta: &Meta, cmd: DlxCommand, effects: &mut Vec<Effect>) -> Reply {
        match cmd {
            DlxCommand::AttachWorker { pid, prefetch } => {
                if self.cfg.dead_letter_handler != Some(DeadLetterHandler::AtLeastOnce) {
                    tracing::debug!(
                        queue = %self.cfg.name,
                        worker = %pid,
                        "dead-letter worker attach without at-least-once handler"
                    );
                    return Reply::Ok;
                }
                effects.push(Effect::Monitor(MonitorTarget::Process(pid.clone())));
                self.dlx.attach_worker(pid, prefetch, effects);
                Reply::Ok
            }
            DlxCommand::Settle { msg_ids } => {
                self.last_active = meta.system_time;
                for msg in self.dlx.settle(&msg_ids) {
                    self.live_indexes.remove(msg.index);
                    self.messages_total -= 1;
                }
                self.dlx.deliver(effects);
                Reply::Ok
            }
        }
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    fn handle_down(
        &mut self,
        meta: &Meta,
        pid: Pid,
        reason: DownReason,
        effects: &mut Vec<Effect>,
    ) {
        self.last_active = meta.system_time;
        match reason {
            DownReason::NoConnection => {
                let node = pid.node().clone();
                effects.push(Effect::Monitor(MonitorTarget::Node(node.clone())));
                for enqueuer in self
                    .enqueuers
                    .values_mut()
                    .filter(|e| e.pid.node() == &node)
                {
                    enqueuer.status = EnqueuerStatus::SuspectedDown;
                }
                let keys: Vec<ConsumerKey> = self
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.cfg.ident.pid.node() == &node)
                    .map(|(k, _)| *k)
                    .collect();
                for key in keys {
                    self.return_all(key);
                    self.service_queue.remove(key);
                    if self.cfg.single_active() {
                        if let Some(mut consumer) = self.consumers.remove(&key) {
                            consumer.status = ConsumerStatus::SuspectedDown;
                            self.insert_waiting(key, consumer);
                        }
                    } else if let Some(consumer) = self.consumers.get_mut(&key) {
                        consumer.status = ConsumerStatus::SuspectedDown;
                    }
                }
                for (_, consumer) in self
                    .waiting_consumers
                    .iter_mut()
                    .filter(|(_, c)| c.cfg.ident.pid.node() == &node)
                {
                    consumer.status = ConsumerStatus::SuspectedDown;
                }
            }
            DownReason::Other(term) => {
                tracing::debug!(%pid, reason = %term, "monitored process down");
                self.enqueuers.remove(&pid);
                self.dlx.worker_down(&pid);
                let keys: Vec<ConsumerKey> = self
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.cfg.ident.pid == pid)
                    .map(|(k, _)| *k)
                    .collect();
                for key in keys {
                    let cancelled = self
                        .consumers
                        .get(&key)
                        .is_some_and(|c| c.status == ConsumerStatus::Cancelled);
                    if !cancelled {
                        self.return_all(key);
                    }
                    self.delete_consumer(key, effects);
                }
                self.waiting_consumers
                    .retain(|(_, c)| c.cfg.ident.pid != pid);
            }
        }
    }

    fn handle_node_up(&mut self, meta: &Meta, node: &NodeId, effects: &mut Vec<Effect>) {
        self.last_active = meta.system_time;
        for enqueuer in self
            .enqueuers
            .values_mut()
            .filter(|e| e.pid.node() == node && e.status == EnqueuerStatus::SuspectedDown)
        {
            enqueuer.status = EnqueuerStatus::Up;
            effects.push(Effect::Monitor(MonitorTarget::Process(
                enqueuer.pid.clone(),
            )));
        }
        let keys: Vec<ConsumerKey> = self
            .consumers
            .iter()
            .filter(|(_, c)| {
                c.cfg.ident.pid.node() == node && c.status == ConsumerStatus::SuspectedDown
            })
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(consumer) = self.consumers.get_mut(&key) {
                consumer.status = ConsumerStatus::Up;
                effects.push(Effect::Monitor(MonitorTarget::Process(
                    consumer.cfg.ident.pid.clone(),
                )));
                let priority = consumer.cfg.priority;
                if consumer.is_serviceable() {
                    self.service_queue.push(key, priority);
                }
            }
        }
        for (_, consumer) in self.waiting_consumers.iter_mut().filter(|(_, c)| {
            c.cfg.ident.pid.node() == node && c.status == ConsumerStatus::SuspectedDown
        }) {
            consumer.status = ConsumerStatus::Up;
            effects.push(Effect::Monitor(MonitorTarget::Process(
                consumer.cfg.ident.pid.clone(),
            )));
        }
        self.sort_waiting();
    }

    fn forget_node(&mut self, meta: &Meta, node: &NodeId, effects: &mut Vec<Effect>) {
        let pids: BTreeSet<Pid> = self
            .enqueuers
            .keys()
            .filter(|p| p.node() == node)
            .cloned()
            .chain(
                self.consumers
                    .values()
                    .map(|c| c.cfg.ident.pid.clone())
                    .filter(|p| p.node() == node),
            )
            .chain(
                self.waiting_consumers
                    .iter()
                    .map(|(_, c)| c.cfg.ident.pid.clone())
                    .filter(|p| p.node() == node),
            )
            .collect();
        for pid in pids {
            self.handle_down(meta, pid, DownReason::Other("purged".to_string()), effects);
        }
    }

    /// Return checked-out messages held past the consumer lock.
    fn eval_consumer_timeouts(&mut self, meta: &Meta, keys: &[ConsumerKey]) {
        let Some(lock_ms) = self.cfg.consumer_lock_ms else {
            return;
        };
        for key in keys {
            let late: Vec<MsgId> = match self.consumers.get(key) {
                Some(consumer) => consumer
                    .checked_out
                    .iter()
                    .filter(|(_, c)| c.deadline + lock_ms < meta.system_time)
                    .map(|(id, _)| *id)
                    .collect(),
                None => continue,
            };
            if late.is_empty() {
                continue;
            }
            let mut freed = Vec::new();
            if let Some(consumer) = self.consumers.get_mut(key) {
                for msg_id in &late {
                    if let Some(checked) = consumer.checked_out.remove(msg_id) {
                        freed.push(checked.msg);
                    }
                }
                consumer.status = ConsumerStatus::TimedOut;
                if consumer.cfg.lifetime != ConsumerLifetime::Once {
                    consumer.replenish_credit(freed.len() as u32);
                }
            }
            for msg in freed {
                self.msg_bytes_checkout -= msg.size();
                self.msg_bytes_enqueue += msg.size();
                self.returns.push_back(msg);
            }
            self.service_queue.remove(*key);
            tracing::debug!(consumer = %key, count = late.len(), "consumer lock timed out");
        }
    }

    // ========================================================================
    // Single-active controller
    // ========================================================================

    /// Run the activation ladder until it stabilizes.
    pub(crate) fn evaluate_single_active(&mut self, effects: &mut Vec<Effect>) {
        if !self.cfg.single_active() {
            return;
        }
        loop {
            match self.active_consumer() {
                None => {
                    let Some(pos) = self
                        .waiting_consumers
                        .iter()
                        .position(|(_, c)| c.status == ConsumerStatus::Up)
                    else {
                        return;
                    };
                    let (key, consumer) = self.waiting_consumers.remove(pos);
                    self.promote(key, consumer, effects);
                    // re-check: the new active may itself be preempted
                }
                Some((key, status)) => {
                    let contender_priority = self
                        .waiting_consumers
                        .iter()
                        .filter(|(_, c)| c.status == ConsumerStatus::Up)
                        .map(|(_, c)| c.cfg.priority)
                        .next();
                    let (active_priority, drained) = match self.consumers.get(&key) {
                        Some(c) => (c.cfg.priority, c.checked_out.is_empty()),
                        None => return,
                    };
                    let Some(contender_priority) = contender_priority else {
                        // a fading consumer whose contender vanished
                        // becomes plainly active again
                        if status == ConsumerStatus::Fading {
                            if let Some(consumer) = self.consumers.get_mut(&key) {
                                consumer.status = ConsumerStatus::Up;
                            }
                            self.reactivate(key);
                        }
                        return;
                    };
                    if contender_priority <= active_priority {
                        // no outranking contender left; stop fading
                        if status == ConsumerStatus::Fading {
                            if let Some(consumer) = self.consumers.get_mut(&key) {
                                consumer.status = ConsumerStatus::Up;
                            }
                            self.reactivate(key);
                        }
                        return;
                    }
                    if drained {
                        self.demote(key, effects);
                        // loop promotes the contender next
                    } else if status == ConsumerStatus::Up {
                        if let Some(consumer) = self.consumers.get_mut(&key) {
                            consumer.status = ConsumerStatus::Fading;
                        }
                        self.service_queue.remove(key);
                        return;
                    } else {
                        // already fading, still draining
                        return;
                    }
                }
            }
        }
    }

    /// The consumer currently holding the active slot, if any.
    pub(crate) fn active_consumer(&self) -> Option<(ConsumerKey, ConsumerStatus)> {
        self.consumers
            .iter()
            .find(|(_, c)| matches!(c.status, ConsumerStatus::Up | ConsumerStatus::Fading))
            .map(|(k, c)| (*k, c.status))
    }

    fn promote(&mut self, key: ConsumerKey, mut consumer: Consumer, effects: &mut Vec<Effect>) {
        consumer.status = ConsumerStatus::Up;
        effects.push(Effect::SendMsg {
            pid: consumer.cfg.ident.pid.clone(),
            msg: OutboundMsg::ConsumerUpdate {
                tag: consumer.cfg.ident.tag.clone(),
                active: true,
                single_active: true,
            },
        });
        if consumer.is_serviceable() {
            self.service_queue.push(key, consumer.cfg.priority);
        }
        self.consumers.insert(key, consumer);
    }

    fn demote(&mut self, key: ConsumerKey, effects: &mut Vec<Effect>) {
        self.service_queue.remove(key);
        if let Some(mut consumer) = self.consumers.remove(&key) {
            consumer.status = ConsumerStatus::Up;
            effects.push(Effect::SendMsg {
                pid: consumer.cfg.ident.pid.clone(),
                msg: OutboundMsg::ConsumerUpdate {
                    tag: consumer.cfg.ident.tag.clone(),
                    active: false,
                    single_active: true,
                },
            });
            self.insert_waiting(key, consumer);
        }
    }

    pub(crate) fn insert_waiting(&mut self, key: ConsumerKey, consumer: Consumer) {
        self.waiting_consumers.push((key, consumer));
        self.sort_waiting();
    }

    fn sort_waiting(&mut self) {
        self.waiting_consumers.sort_by(|(key_a, a), (key_b, b)| {
            b.cfg
                .priority
                .cmp(&a.cfg.priority)
                .then(b.credit.cmp(&a.credit))
                .then(key_a.cmp(key_b))
        });
    }

    // ========================================================================
    // Limits and overflow
    // ========================================================================

    pub(crate) fn enforce_limits(&mut self, meta: &Meta, effects: &mut Vec<Effect>) {
        match self.cfg.overflow_strategy {
            OverflowStrategy::DropHead => {
                while self.is_over_limit() {
                    let Some(msg) = self.take_next() else {
                        break;
                    };
                    self.msg_bytes_enqueue -= msg.size();
                    self.dead_letter(DeadLetterReason::Maxlen, vec![msg], effects);
                }
            }
            OverflowStrategy::RejectPublish => {
                if self.is_over_limit() {
                    let index = meta.index;
                    let mut newly_blocked = Vec::new();
                    for enqueuer in self.enqueuers.values_mut() {
                        if enqueuer.blocked_at.is_none() {
                            enqueuer.blocked_at = Some(index);
                            newly_blocked.push(enqueuer.pid.clone());
                        }
                    }
                    for pid in newly_blocked {
                        tracing::debug!(
                            queue = %self.cfg.name,
                            publisher = %pid,
                            "rejecting publishes"
                        );
                        effects.push(Effect::SendMsg {
                            pid,
                            msg: OutboundMsg::QueueStatus(QueueStatus::RejectPublish),
                        });
                    }
                } else if self.is_below_soft_limit() {
                    let mut unblocked = Vec::new();
                    for enqueuer in self.enqueuers.values_mut() {
                        if enqueuer.blocked_at.take().is_some() {
                            unblocked.push(enqueuer.pid.clone());
                        }
                    }
                    for pid in unblocked {
                        effects.push(Effect::SendMsg {
                            pid,
                            msg: OutboundMsg::QueueStatus(QueueStatus::Go),
                        });
                    }
                }
            }
        }
    }

    fn is_over_limit(&self) -> bool {
        let count = self.ready_plus_dlx_count();
        let bytes = self.msg_bytes_enqueue + self.dlx.msg_bytes();
        self.cfg.max_length.is_some_and(|max| count > max)
            || self.cfg.max_bytes.is_some_and(|max| bytes > max)
    }

    fn is_below_soft_limit(&self) -> bool {
        let count = self.ready_plus_dlx_count();
        let bytes = self.msg_bytes_enqueue + self.dlx.msg_bytes();
        let ratio = crate::constants::REJECT_PUBLISH_RESUME_RATIO;
        let under =
            |value: u64, max: Option<u64>| max.is_none_or(|max| value <= (max as f64 * ratio) as u64);
        under(count, self.cfg.max_length) && under(bytes, self.cfg.max_bytes)
    }

    fn ready_plus_dlx_count(&self) -> u64 {
        (self.messages.len() + self.returns.len()) as u64 + self.dlx.count()
    }

    /// Emit a deleter callback once the queue has idled past `expires`
    /// with no consumers attached.
    fn check_queue_expiry(&self, meta: &Meta, effects: &mut Vec<Effect>) {
        let Some(expires) = self.cfg.expires else {
            return;
        };
        let in_use = !self.consumers.is_empty() || !self.waiting_consumers.is_empty();
        if !in_use && meta.system_time > self.last_active + expires {
            effects.push(Effect::ModCall {
                module: "queue_janitor".to_string(),
                function: "spawn_deleter".to_string(),
                args: vec![self.cfg.resource.clone()],
            });
        }
    }

    // ========================================================================
    // Return-to-queue plumbing
    // ========================================================================

    /// Return every checked-out message of a consumer, in msg-id order.
    /// The delivery count is not incremented: this path serves liveness
    /// and removal, not an explicit client return.
    pub(crate) fn return_all(&mut self, key: ConsumerKey) {
        let Some(consumer) = self.consumers.get_mut(&key) else {
            return;
        };
        let checked = std::mem::take(&mut consumer.checked_out);
        if consumer.cfg.lifetime != ConsumerLifetime::Once {
            consumer.replenish_credit(checked.len() as u32);
        }
        for (_, checked_msg) in checked {
            self.msg_bytes_checkout -= checked_msg.msg.size();
            self.msg_bytes_enqueue += checked_msg.msg.size();
            self.returns.push_back(checked_msg.msg);
        }
    }

    /// Next ready message: returns drain before first-time messages.
    pub(crate) fn take_next(&mut self) -> Option<MsgRef> {
        if let Some(msg) = self.returns.pop_front() {
            // returned messages are already indexed
            return Some(msg);
        }
        let msg = self.messages.pop_front()?;
        self.live_indexes.insert(msg.index);
        Some(msg)
    }

    // ========================================================================
    // Release cursors
    // ========================================================================

    /// The snapshot form: everything except the fields the substrate can
    /// rebuild from the log suffix.
    pub fn dehydrate(&self) -> QueueState {
        let mut state = self.clone();
        state.live_indexes.clear();
        state.release_cursors.clear();
        state.enqueue_count = 0;
        state.msg_cache = None;
        state.dlx = self.dlx.dehydrate();
        state
    }

    /// Rebuild the fields a dehydrated snapshot omits. The live index
    /// set is fully derived from the refs the state still holds.
    pub fn rehydrate(&mut self) {
        self.live_indexes.clear();
        let indexes: Vec<LogIndex> = self
            .messages
            .iter()
            .chain(self.returns.iter())
            .map(|m| m.index)
            .chain(
                self.consumers
                    .values()
                    .flat_map(|c| c.checked_out.values().map(|checked| checked.msg.index)),
            )
            .chain(self.dlx.refs().map(|m| m.index))
            .collect();
        for index in indexes {
            self.live_indexes.insert(index);
        }
    }

    fn stage_release_cursor(&mut self, meta: &Meta) {
        let (base, current) = self.cfg.release_cursor_interval;
        if self.enqueue_count < current {
            return;
        }
        let dehydrated = self.dehydrate();
        self.release_cursors.push_back(ReleaseCursor {
            index: meta.index,
            state: Box::new(dehydrated),
        });
        self.enqueue_count = 0;
        // adapt to backlog depth: deep queues snapshot less often
        self.cfg.release_cursor_interval = (
            base,
            self.messages_total.clamp(base, RELEASE_CURSOR_INTERVAL_MAX),
        );
    }

    fn maybe_emit_release_cursor(
        &mut self,
        meta: &Meta,
        was_live: bool,
        effects: &mut Vec<Effect>,
    ) {
        if self.live_indexes.is_empty() && self.enqueuers.is_empty() {
            // drained queue: a fresh cursor at this command's index
            // supersedes anything staged
            if was_live || !self.release_cursors.is_empty() {
                self.release_cursors.clear();
                self.enqueue_count = 0;
                effects.push(Effect::ReleaseCursor {
                    index: meta.index,
                    state: Box::new(self.dehydrate()),
                });
            }
            return;
        }
        while let Some(front) = self.release_cursors.front() {
            let passed = match self.live_indexes.smallest() {
                Some(smallest) => smallest > front.index,
                None => true,
            };
            if !passed {
                break;
            }
            if let Some(cursor) = self.release_cursors.pop_front() {
                effects.push(Effect::ReleaseCursor {
                    index: cursor.index,
                    state: cursor.state,
                });
            }
        }
    }

    // ========================================================================
    // Lookup helpers
    // ========================================================================

    pub(crate) fn resolve_consumer_ref(&self, cref: &ConsumerRef) -> Option<ConsumerKey> {
        match cref {
            ConsumerRef::Key(key) => {
                if self.consumers.contains_key(key)
                    || self.waiting_consumers.iter().any(|(k, _)| k == key)
                {
                    Some(*key)
                } else {
                    None
                }
            }
            ConsumerRef::Ident(ident) => self.find_key_by_ident(ident),
        }
    }

    pub(crate) fn find_key_by_ident(&self, ident: &ConsumerIdent) -> Option<ConsumerKey> {
        self.consumers
            .iter()
            .find(|(_, c)| &c.cfg.ident == ident)
            .map(|(k, _)| *k)
            .or_else(|| {
                self.waiting_consumers
                    .iter()
                    .find(|(_, c)| &c.cfg.ident == ident)
                    .map(|(k, _)| *k)
            })
    }

    fn find_waiting_by_ref(&self, cref: &ConsumerRef) -> Option<usize> {
        match cref {
            ConsumerRef::Key(key) => self.waiting_consumers.iter().position(|(k, _)| k == key),
            ConsumerRef::Ident(ident) => self
                .waiting_consumers
                .iter()
                .position(|(_, c)| &c.cfg.ident == ident),
        }
    }

    fn ref_key(cref: &ConsumerRef) -> ConsumerKey {
        match cref {
            ConsumerRef::Key(key) => *key,
            ConsumerRef::Ident(_) => ConsumerKey::default(),
        }
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// Cross-check the counters against the structures they summarize.
    /// A mismatch is a programming error; the replica must not keep
    /// serving from corrupt state.
    fn assert_invariants(&self) {
        #[cfg(debug_assertions)]
        {
            let checked: u64 = self
                .consumers
                .values()
                .map(|c| c.checked_out.len() as u64)
                .sum();
            let expected_total =
                (self.messages.len() + self.returns.len()) as u64 + checked + self.dlx.count();
            debug_assert_eq!(self.messages_total, expected_total, "messages_total drifted");

            let mut expected_live = BTreeSet::new();
            for msg in self.messages.iter().chain(self.returns.iter()) {
                expected_live.insert(msg.index);
            }
            for consumer in self.consumers.values() {
                for checked_msg in consumer.checked_out.values() {
                    expected_live.insert(checked_msg.msg.index);
                }
            }
            for msg in self.dlx.refs() {
                expected_live.insert(msg.index);
            }
            let live: BTreeSet<LogIndex> = self.live_indexes.iter().collect();
            debug_assert_eq!(live, expected_live, "live index set drifted");

            let enqueue_bytes: u64 = self
                .messages
                .iter()
                .chain(self.returns.iter())
                .map(|m| m.size())
                .sum();
            debug_assert_eq!(
                self.msg_bytes_enqueue, enqueue_bytes,
                "enqueue bytes drifted"
            );
            let checkout_bytes: u64 = self
                .consumers
                .values()
                .map(|c| c.checked_out_bytes())
                .sum();
            debug_assert_eq!(
                self.msg_bytes_checkout, checkout_bytes,
                "checkout bytes drifted"
            );

            if self.cfg.single_active() {
                let active = self
                    .consumers
                    .values()
                    .filter(|c| matches!(c.status, ConsumerStatus::Up | ConsumerStatus::Fading))
                    .count();
                debug_assert!(active <= 1, "multiple active single-active consumers");
            }
        }
    }
}
