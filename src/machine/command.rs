//! Commands, metadata and replies of the queue state machine.
//!
//! Commands are the inputs replicated through the consensus log and
//! applied deterministically on every replica. All time and identity
//! inputs ride in [`Meta`]; no handler reads a clock.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Error;
use crate::machine::config::ConfigUpdate;
use crate::machine::consumer::{ConsumerIdent, ConsumerLifetime, CreditMode};
use crate::machine::dlx::DlxCommand;
use crate::machine::message::MsgRef;
use crate::types::{ConsumerKey, LogIndex, MsgId, NodeId, Pid};

/// Per-command metadata supplied by the replication substrate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Log index this command was committed at.
    pub index: LogIndex,
    /// Leader wall-clock at append time (ms). The only time source
    /// handlers may observe.
    pub system_time: u64,
    /// Requesting process, when the command has one.
    pub from: Option<Pid>,
    /// How the caller wants its reply routed.
    pub reply_mode: ReplyMode,
}

impl Meta {
    /// Metadata with no caller attached.
    pub fn new(index: LogIndex, system_time: u64) -> Self {
        Meta {
            index,
            system_time,
            from: None,
            reply_mode: ReplyMode::NoReply,
        }
    }

    /// The pid a compact enqueue publishes as, if any.
    pub fn notify_pid(&self) -> Option<&Pid> {
        match &self.reply_mode {
            ReplyMode::Notify { pid, .. } => Some(pid),
            ReplyMode::NoReply => None,
        }
    }
}

/// Reply routing requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Fire and forget.
    #[default]
    NoReply,
    /// Notify `pid`, correlating with the caller-chosen token. The
    /// compact enqueue also derives its publisher identity from this.
    Notify { pid: Pid, correlation: u64 },
}

/// Why a monitored process went down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownReason {
    /// The connection to its node was lost; the process may still be
    /// alive and come back with `nodeup`.
    NoConnection,
    /// Definitive termination with the given reason.
    Other(String),
}

/// What a checkout command asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutSpec {
    /// Register (or merge) a consumer for ongoing deliveries.
    Attach {
        lifetime: ConsumerLifetime,
        credit_mode: CreditMode,
    },
    /// Draw a single message synchronously (basic.get semantics).
    Dequeue(Settlement),
    /// Stop deliveries; retain the consumer until it settles everything.
    Cancel,
    /// Detach abruptly; checked-out messages return to the queue.
    Remove,
}

/// Settlement discipline of a one-shot dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    /// The message is settled as soon as it is drawn.
    Settled,
    /// The caller settles explicitly.
    Unsettled,
}

/// How a command addresses an already-registered consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerRef {
    /// Canonical integer key (the attach log index).
    Key(ConsumerKey),
    /// Legacy `(tag, pid)` identity; resolved by the dispatcher.
    Ident(ConsumerIdent),
}

impl From<ConsumerKey> for ConsumerRef {
    fn from(key: ConsumerKey) -> Self {
        ConsumerRef::Key(key)
    }
}

impl From<ConsumerIdent> for ConsumerRef {
    fn from(ident: ConsumerIdent) -> Self {
        ConsumerRef::Ident(ident)
    }
}

/// Commands applied to the queue state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Append a message. Tracked when `pid`/`seq` are set.
    Enqueue {
        pid: Option<Pid>,
        seq: Option<u64>,
        payload: Bytes,
        ttl_ms: Option<u64>,
    },

    /// Compact enqueue: the publisher pid rides in `Meta::reply_mode`.
    EnqueueCompact {
        seq: u64,
        payload: Bytes,
        ttl_ms: Option<u64>,
    },

    /// Pre-register a publisher so its first enqueue is already gated.
    RegisterEnqueuer { pid: Pid },

    /// Attach, dequeue, cancel or remove a consumer.
    Checkout {
        consumer: ConsumerIdent,
        spec: CheckoutSpec,
        priority: u8,
        meta: BTreeMap<String, String>,
    },

    /// Acknowledge delivered messages.
    Settle {
        consumer: ConsumerRef,
        msg_ids: Vec<MsgId>,
    },

    /// Give delivered messages back for redelivery.
    Return {
        consumer: ConsumerRef,
        msg_ids: Vec<MsgId>,
    },

    /// Reject delivered messages into the dead-letter path.
    Discard {
        consumer: ConsumerRef,
        msg_ids: Vec<MsgId>,
    },

    /// Restart the consumer-lock timer on delivered messages.
    Defer {
        consumer: ConsumerRef,
        msg_ids: Vec<MsgId>,
    },

    /// Grant credit (protocol v1 absolute, protocol v2 delivery-count).
    Credit {
        consumer: ConsumerRef,
        credit: u32,
        delivery_count: u32,
        drain: bool,
    },

    /// Re-append a checked-out message at this command's log index.
    Requeue {
        consumer: ConsumerRef,
        msg_id: MsgId,
        payload: Bytes,
    },

    /// Drop all ready messages.
    Purge,

    /// Forget every process hosted on the given nodes.
    PurgeNodes { nodes: Vec<NodeId> },

    /// Merge a configuration update.
    UpdateConfig { update: ConfigUpdate },

    /// Ask the auxiliary handler to garbage-collect.
    GarbageCollection,

    /// Check the listed consumers against the consumer lock.
    EvalConsumerTimeouts { keys: Vec<ConsumerKey> },

    /// Periodic tick: expire TTL'd messages at the head.
    ExpireMsgs,

    /// A monitored process went down.
    Down { pid: Pid, reason: DownReason },

    /// A previously disconnected node is reachable again.
    NodeUp { node: NodeId },

    /// A node became unreachable.
    NodeDown { node: NodeId },

    /// Rewrite an older state shape forward.
    UpgradeMachine { from: u8, to: u8 },

    /// Dead-letter sidecar commands.
    Dlx(DlxCommand),

    /// No-op (used by the substrate for barrier reads).
    Noop,
}

/// Reply from applying a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    /// Generic success.
    Ok,

    /// Ready messages dropped by a purge.
    Purged { count: u64 },

    /// Consumer registration summary.
    Checkout(CheckoutReply),

    /// Outcome of a one-shot dequeue.
    Dequeue(DequeueReply),

    /// Credit v1 acknowledgement.
    Credit(CreditReply),

    /// A recoverable error for the caller.
    Error(Error),
}

impl Reply {
    /// Whether this reply is an error.
    pub fn is_err(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// Registration summary returned from an attach checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutReply {
    /// Canonical key assigned (or previously assigned) to the consumer.
    pub key: ConsumerKey,
    /// Credit remaining after the attach and any immediate deliveries.
    pub credit: u32,
    /// Consumer delivery count.
    pub delivery_count: u32,
    /// Messages currently checked out to the consumer.
    pub num_checked_out: usize,
    /// Whether the consumer is active (single-active: not waiting).
    pub active: bool,
}

/// Outcome of a successful one-shot dequeue. An empty queue is the
/// [`Error::DequeueEmpty`] reply instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequeueReply {
    /// A message was drawn; its body arrives via the delivery effect.
    Message {
        msg_id: MsgId,
        msg: MsgRef,
        /// Messages still ready after the draw.
        ready: u64,
    },
}

/// Credit v1 acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditReply {
    /// Messages ready for delivery after the grant.
    pub available: u64,
    /// Credit consumed by a drain, when `drain` was set.
    pub drained: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Meta {
        Meta::new(LogIndex::new(1), 1000)
    }

    #[test]
    fn test_meta_notify_pid() {
        let mut m = meta();
        assert_eq!(m.notify_pid(), None);
        m.reply_mode = ReplyMode::Notify {
            pid: Pid::new("n1", 7),
            correlation: 3,
        };
        assert_eq!(m.notify_pid(), Some(&Pid::new("n1", 7)));
    }

    #[test]
    fn test_enqueue_command_roundtrip() {
        let cmd = Command::Enqueue {
            pid: Some(Pid::new("n1", 1)),
            seq: Some(0),
            payload: Bytes::from_static(b"hello"),
            ttl_ms: Some(30_000),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn test_checkout_command_roundtrip() {
        let cmd = Command::Checkout {
            consumer: ConsumerIdent::new("ctag-1", Pid::new("n1", 2)),
            spec: CheckoutSpec::Attach {
                lifetime: ConsumerLifetime::Auto,
                credit_mode: CreditMode::SimplePrefetch { max: 50 },
            },
            priority: 3,
            meta: BTreeMap::new(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn test_settle_command_bincode_roundtrip() {
        let cmd = Command::Settle {
            consumer: ConsumerRef::Key(ConsumerKey::new(4)),
            msg_ids: vec![MsgId::new(0), MsgId::new(1)],
        };
        let bytes = bincode::serialize(&cmd).unwrap();
        let back: Command = bincode::deserialize(&bytes).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn test_down_command_roundtrip() {
        let cmd = Command::Down {
            pid: Pid::new("n2", 9),
            reason: DownReason::NoConnection,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("no_connection"));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn test_consumer_ref_from_impls() {
        let by_key: ConsumerRef = ConsumerKey::new(8).into();
        assert!(matches!(by_key, ConsumerRef::Key(k) if k.value() == 8));
        let by_ident: ConsumerRef = ConsumerIdent::new("t", Pid::new("n", 1)).into();
        assert!(matches!(by_ident, ConsumerRef::Ident(_)));
    }

    #[test]
    fn test_reply_is_err() {
        assert!(Reply::Error(Error::DequeueEmpty).is_err());
        assert!(!Reply::Ok.is_err());
    }

    #[test]
    fn test_reply_roundtrip() {
        let reply = Reply::Checkout(CheckoutReply {
            key: ConsumerKey::new(12),
            credit: 5,
            delivery_count: 0,
            num_checked_out: 2,
            active: true,
        });
        let json = serde_json::to_string(&reply).unwrap();
        let back: Reply = serde_json::from_str(&json).unwrap();
        assert_eq!(reply, back);
    }

    #[test]
    fn test_unicode_payload_roundtrip() {
        let cmd = Command::Enqueue {
            pid: None,
            seq: None,
            payload: Bytes::from("メッセージ-🚀".as_bytes().to_vec()),
            ttl_ms: None,
        };
        let bytes = bincode::serialize(&cmd).unwrap();
        let back: Command = bincode::deserialize(&bytes).unwrap();
        assert_eq!(cmd, back);
    }
}
