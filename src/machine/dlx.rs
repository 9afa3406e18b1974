//! Dead-letter sidecar.
//!
//! Messages discarded for `expired`, `maxlen`, `delivery_limit` or
//! `rejected` land here when the queue is configured with an
//! at-least-once dead-letter handler. Entries stay part of the queue's
//! message accounting (and keep their log indexes live) until the
//! dead-letter worker settles them; the at-most-once path never enters
//! this state and forwards through a host callback instead.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;

use crate::machine::effect::{DeliveryPlan, Effect};
use crate::machine::message::MsgRef;
use crate::types::{MsgId, Pid};

/// Consumer tag the dead-letter worker attaches under.
pub const DLX_WORKER_TAG: &str = "dlx-worker";

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Per-message or queue TTL elapsed.
    Expired,
    /// Dropped from the head under `drop_head` overflow.
    Maxlen,
    /// Returned more times than the delivery limit allows.
    DeliveryLimit,
    /// Explicitly discarded by a consumer.
    Rejected,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeadLetterReason::Expired => "expired",
            DeadLetterReason::Maxlen => "maxlen",
            DeadLetterReason::DeliveryLimit => "delivery_limit",
            DeadLetterReason::Rejected => "rejected",
        };
        write!(f, "{name}")
    }
}

/// Sidecar commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlxCommand {
    /// Register (or replace) the dead-letter worker process.
    AttachWorker { pid: Pid, prefetch: u32 },
    /// The worker finished forwarding the given deliveries.
    Settle { msg_ids: Vec<MsgId> },
}

/// A discarded message awaiting the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlxEntry {
    pub reason: DeadLetterReason,
    pub msg: MsgRef,
}

/// The registered dead-letter worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlxWorker {
    pub pid: Pid,
    pub prefetch: u32,
    pub next_msg_id: MsgId,
    pub checked_out: BTreeMap<MsgId, DlxEntry>,
}

/// Sidecar state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DlxState {
    discards: VecDeque<DlxEntry>,
    worker: Option<DlxWorker>,
    msg_bytes: u64,
}

impl DlxState {
    /// Create an empty sidecar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages held by the sidecar (queued plus checked out).
    pub fn count(&self) -> u64 {
        let checked = self
            .worker
            .as_ref()
            .map(|w| w.checked_out.len())
            .unwrap_or(0);
        (self.discards.len() + checked) as u64
    }

    /// Bytes held by the sidecar.
    pub fn msg_bytes(&self) -> u64 {
        self.msg_bytes
    }

    /// The registered worker, if any.
    pub fn worker(&self) -> Option<&DlxWorker> {
        self.worker.as_ref()
    }

    /// Queue a batch of discards, preserving the caller's order.
    pub fn discard(&mut self, reason: DeadLetterReason, msgs: impl IntoIterator<Item = MsgRef>) {
        for msg in msgs {
            self.msg_bytes = self.msg_bytes.saturating_add(msg.size());
            self.discards.push_back(DlxEntry { reason, msg });
        }
    }

    /// Register or replace the worker. A replaced worker's checked-out
    /// entries return to the head of the discard queue in id order.
    pub fn attach_worker(&mut self, pid: Pid, prefetch: u32, effects: &mut Vec<Effect>) {
        if let Some(old) = self.worker.take() {
            if old.pid != pid {
                for (_, entry) in old.checked_out.into_iter().rev() {
                    self.discards.push_front(entry);
                }
            } else {
                // same worker re-attaching keeps its deliveries
                self.worker = Some(DlxWorker {
                    pid,
                    prefetch,
                    next_msg_id: old.next_msg_id,
                    checked_out: old.checked_out,
                });
                self.deliver(effects);
                return;
            }
        }
        self.worker = Some(DlxWorker {
            pid,
            prefetch,
            next_msg_id: MsgId::new(0),
            checked_out: BTreeMap::new(),
        });
        self.deliver(effects);
    }

    /// Settle worker deliveries. Returns the freed refs so the queue can
    /// release their log indexes and message accounting.
    pub fn settle(&mut self, msg_ids: &[MsgId]) -> Vec<MsgRef> {
        let Some(worker) = self.worker.as_mut() else {
            return Vec::new();
        };
        let mut freed = Vec::new();
        for msg_id in msg_ids {
            if let Some(entry) = worker.checked_out.remove(msg_id) {
                self.msg_bytes = self.msg_bytes.saturating_sub(entry.msg.size());
                freed.push(entry.msg);
            }
        }
        freed
    }

    /// Push queued discards to the worker, up to its prefetch.
    pub fn deliver(&mut self, effects: &mut Vec<Effect>) {
        let Some(worker) = self.worker.as_mut() else {
            return;
        };
        let room = (worker.prefetch as usize).saturating_sub(worker.checked_out.len());
        if room == 0 || self.discards.is_empty() {
            return;
        }
        let mut msgs = Vec::new();
        for _ in 0..room {
            let Some(entry) = self.discards.pop_front() else {
                break;
            };
            let msg_id = worker.next_msg_id;
            worker.next_msg_id = msg_id.next();
            worker.checked_out.insert(msg_id, entry);
            msgs.push((msg_id, entry.msg));
        }
        if !msgs.is_empty() {
            effects.push(Effect::LogRead {
                plan: DeliveryPlan {
                    pid: worker.pid.clone(),
                    tag: DLX_WORKER_TAG.to_string(),
                    msgs,
                },
            });
        }
    }

    /// Handle the worker process going down: its deliveries return to
    /// the discard queue for the next worker.
    pub fn worker_down(&mut self, pid: &Pid) {
        if let Some(worker) = self.worker.take_if(|w| &w.pid == pid) {
            for (_, entry) in worker.checked_out.into_iter().rev() {
                self.discards.push_front(entry);
            }
        }
    }

    /// Iterate every ref held by the sidecar.
    pub fn refs(&self) -> impl Iterator<Item = &MsgRef> {
        self.discards.iter().map(|e| &e.msg).chain(
            self.worker
                .iter()
                .flat_map(|w| w.checked_out.values().map(|e| &e.msg)),
        )
    }

    /// Per-reason counts for observability queries.
    pub fn stats(&self) -> BTreeMap<DeadLetterReason, u64> {
        let mut stats = BTreeMap::new();
        let entries = self.discards.iter().chain(
            self.worker
                .iter()
                .flat_map(|w| w.checked_out.values()),
        );
        for entry in entries {
            *stats.entry(entry.reason).or_insert(0) += 1;
        }
        stats
    }

    /// The snapshot form. Entries are authoritative state and all
    /// round-trip; only delivery progress to a live worker is reset so a
    /// restored replica redelivers.
    pub fn dehydrate(&self) -> Self {
        let mut dehydrated = self.clone();
        if let Some(worker) = dehydrated.worker.take() {
            for (_, entry) in worker.checked_out.into_iter().rev() {
                dehydrated.discards.push_front(entry);
            }
            dehydrated.worker = Some(DlxWorker {
                pid: worker.pid,
                prefetch: worker.prefetch,
                next_msg_id: worker.next_msg_id,
                checked_out: BTreeMap::new(),
            });
        }
        dehydrated
    }
}

impl Ord for DeadLetterReason {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

impl PartialOrd for DeadLetterReason {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
