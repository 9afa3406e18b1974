//! In-state message references.
//!
//! Message bodies live in the replicated log; the state only carries a
//! [`MsgRef`] per message: the log index the body was committed at plus a
//! compact [`Header`].

use serde::{Deserialize, Serialize};

use crate::types::LogIndex;

/// Compact per-message header.
///
/// Encoded in the smallest of three shapes: a bare size when only the
/// size is known, a size/expiry pair once a TTL is stamped, and the full
/// map form once a delivery count exists. Mutating helpers re-normalize
/// so a header never carries a wider shape than its contents need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Header {
    /// Only the payload size is set.
    Size(u64),
    /// Size plus absolute expiry timestamp (ms).
    SizeExpiry(u64, u64),
    /// Size, optional expiry, and a non-zero delivery count.
    Full {
        size: u64,
        expiry: Option<u64>,
        delivery_count: u32,
    },
}

impl Header {
    /// Build the smallest header shape for the given fields.
    pub fn new(size: u64, expiry: Option<u64>, delivery_count: u32) -> Self {
        match (expiry, delivery_count) {
            (None, 0) => Header::Size(size),
            (Some(exp), 0) => Header::SizeExpiry(size, exp),
            (expiry, delivery_count) => Header::Full {
                size,
                expiry,
                delivery_count,
            },
        }
    }

    /// The payload size recorded at enqueue time.
    #[inline]
    pub fn size(&self) -> u64 {
        match *self {
            Header::Size(size) => size,
            Header::SizeExpiry(size, _) => size,
            Header::Full { size, .. } => size,
        }
    }

    /// Absolute expiry timestamp, if the message carries a TTL.
    #[inline]
    pub fn expiry(&self) -> Option<u64> {
        match *self {
            Header::Size(_) => None,
            Header::SizeExpiry(_, expiry) => Some(expiry),
            Header::Full { expiry, .. } => expiry,
        }
    }

    /// Number of times the message has been returned to the queue.
    #[inline]
    pub fn delivery_count(&self) -> u32 {
        match *self {
            Header::Full { delivery_count, .. } => delivery_count,
            _ => 0,
        }
    }

    /// Whether the message is expired at `now`.
    #[inline]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiry().is_some_and(|expiry| expiry <= now)
    }

    /// Return the header with its delivery count incremented.
    pub fn incr_delivery_count(self) -> Self {
        Header::new(
            self.size(),
            self.expiry(),
            self.delivery_count().saturating_add(1),
        )
    }
}

/// The state's reference to a message whose body lives in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgRef {
    /// Log index the body was committed at.
    pub index: LogIndex,
    /// Compact header.
    pub header: Header,
}

impl MsgRef {
    /// Create a message reference.
    pub fn new(index: LogIndex, header: Header) -> Self {
        MsgRef { index, header }
    }

    /// The recorded payload size.
    #[inline]
    pub fn size(&self) -> u64 {
        self.header.size()
    }
}

/// A message delivered to a consumer but not yet settled.
///
/// `deadline` is the system timestamp of the delivery and anchors the
/// consumer-lock timeout; `defer` restarts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedMsg {
    /// System time the message was delivered (or last deferred).
    pub deadline: u64,
    /// The referenced message.
    pub msg: MsgRef,
}

impl CheckedMsg {
    /// Record a delivery at `now`.
    pub fn new(now: u64, msg: MsgRef) -> Self {
        CheckedMsg { deadline: now, msg }
    }
}
