//! Type-safe wrappers for queue state machine primitives.
//!
//! These newtypes prevent mixing up different integer identifiers that
//! share an underlying representation but mean different things: log
//! indexes assigned by the replication substrate, per-consumer message
//! ids, and canonical consumer keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An index into the replicated command log.
///
/// Log indexes are assigned by the replication substrate, are strictly
/// monotonic, and double as the durable identity of an enqueued message
/// (the message body lives in the log at this index).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    /// Create a new log index from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        LogIndex(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for LogIndex {
    fn from(value: u64) -> Self {
        LogIndex(value)
    }
}

impl From<LogIndex> for u64 {
    fn from(index: LogIndex) -> Self {
        index.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A per-consumer message id.
///
/// Assigned from the consumer's `next_msg_id` counter at delivery time.
/// Settle, return, discard and defer all address checked-out messages
/// by this id, scoped to the consumer they were delivered to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct MsgId(pub u64);

impl MsgId {
    /// Create a new message id from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        MsgId(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The id following this one.
    #[inline]
    pub const fn next(self) -> Self {
        MsgId(self.0 + 1)
    }
}

impl From<u64> for MsgId {
    fn from(value: u64) -> Self {
        MsgId(value)
    }
}

impl From<MsgId> for u64 {
    fn from(id: MsgId) -> Self {
        id.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The canonical identity of a consumer.
///
/// Equal to the log index at which the consumer first attached. Commands
/// may address a consumer either by this key or by its `(tag, pid)`
/// identity; the dispatcher resolves both to this integer form.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ConsumerKey(pub u64);

impl ConsumerKey {
    /// Create a new consumer key from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        ConsumerKey(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<LogIndex> for ConsumerKey {
    fn from(index: LogIndex) -> Self {
        ConsumerKey(index.0)
    }
}

impl From<u64> for ConsumerKey {
    fn from(value: u64) -> Self {
        ConsumerKey(value)
    }
}

impl fmt::Display for ConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The name of a node hosting client processes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a node id from anything string-like.
    pub fn new(name: impl Into<String>) -> Self {
        NodeId(name.into())
    }

    /// Get the node name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity of a client process (publisher, consumer or worker).
///
/// Carries the hosting node so liveness handling can transition every
/// process on a disconnected node at once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pid {
    /// Node the process runs on.
    pub node: NodeId,
    /// Process serial, unique within the node.
    pub seq: u64,
}

impl Pid {
    /// Create a new process identity.
    pub fn new(node: impl Into<String>, seq: u64) -> Self {
        Pid {
            node: NodeId::new(node),
            seq,
        }
    }

    /// The node this process runs on.
    #[inline]
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.seq)
    }
}
