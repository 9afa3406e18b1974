//! Caller-facing errors of the queue state machine.
//!
//! Every error here is recoverable by the caller; none aborts the state
//! machine. Handlers surface them inside the command reply so the
//! substrate can route them back to the requesting process.
//!
//! [`ErrorCode`] is the stable numeric form a gateway puts on the wire.
//! Internal impossibilities (invariant violations) are programming errors
//! and are checked with `debug_assert!` in the core instead of appearing
//! here.

use num_derive::FromPrimitive;
use std::result;
use thiserror::Error as ThisError;

use crate::types::{ConsumerKey, Pid};

pub type Result<T> = result::Result<T, Error>;

/// Errors surfaced to callers of the state machine.
#[derive(Clone, Debug, PartialEq, Eq, ThisError, serde::Serialize, serde::Deserialize)]
pub enum Error {
    /// A settle/return/discard/credit/defer referenced a consumer key
    /// that is neither registered nor resolvable via `(tag, pid)`.
    #[error("invalid consumer key: {0}")]
    InvalidConsumerKey(ConsumerKey),

    /// Cancel or remove of a consumer that does not exist.
    #[error("consumer not found: tag {tag:?} pid {pid}")]
    ConsumerNotFound { tag: String, pid: Pid },

    /// A one-shot dequeue was attempted on a single-active queue.
    #[error("dequeue is not supported on a single-active queue")]
    UnsupportedDequeue,

    /// A tracked publisher enqueued ahead of its expected sequence
    /// number. The caller should retry from `expected` or reset.
    #[error("not enqueued: expected publisher sequence {expected}")]
    NotEnqueued { expected: u64 },

    /// Peek past the end of the queue.
    #[error("no message at position {0}")]
    NoMessageAtPos(u64),

    /// A one-shot dequeue found the queue empty.
    #[error("dequeue: queue is empty")]
    DequeueEmpty,
}

impl Error {
    /// The stable numeric code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::InvalidConsumerKey(_) => ErrorCode::InvalidConsumerKey,
            Error::ConsumerNotFound { .. } => ErrorCode::ConsumerNotFound,
            Error::UnsupportedDequeue => ErrorCode::UnsupportedDequeue,
            Error::NotEnqueued { .. } => ErrorCode::NotEnqueued,
            Error::NoMessageAtPos(_) => ErrorCode::NoMessageAtPos,
            Error::DequeueEmpty => ErrorCode::DequeueEmpty,
        }
    }
}

/// Wire codes for the recoverable queue errors.
///
/// Gateways translate [`Error`] values to these codes when answering
/// clients; `0` is reserved for success.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum ErrorCode {
    #[default]
    None = 0,
    /// Consumer key unknown and not resolvable.
    InvalidConsumerKey = 1,
    /// Cancel/remove target does not exist.
    ConsumerNotFound = 2,
    /// One-shot dequeue on a single-active queue.
    UnsupportedDequeue = 3,
    /// Publisher sequence gap.
    NotEnqueued = 4,
    /// Peek beyond queue length.
    NoMessageAtPos = 5,
    /// One-shot dequeue on an empty queue.
    DequeueEmpty = 6,
}
