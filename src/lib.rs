//! # Fifoesque
//! Deterministic state machine for a replicated FIFO message queue.
//!
//! This crate implements the per-queue logic executed identically on
//! every replica of a consensus group: a pure `apply(meta, command,
//! state)` function producing the new state, the caller's reply and the
//! side-effects the replication substrate interprets (deliveries, log
//! reads, monitors, timers, release cursors).
//!
//! The substrate itself — log replication, leader election, snapshot
//! transport, network I/O — is out of scope; only its contracts appear
//! here, as commands coming in and [`Effect`](machine::Effect)s going
//! out. Message bodies live in the replicated log: the state holds
//! `(log index, header)` references, which keeps snapshots small and
//! makes log truncation via release cursors possible.
//!
//! # Goals
//! - Byte-for-byte determinism: all time arrives in command metadata,
//!   state collections iterate in a fixed order, nothing reads a clock
//! - Strict FIFO delivery with returned messages served first
//! - Two consumer disciplines (competing, single-active) and two credit
//!   protocols (prefetch, delivery-count)
//!
//! ## Getting started
//!
//! ```rust
//! use bytes::Bytes;
//! use fifoesque::machine::{Command, Config, Meta, QueueState, Reply};
//! use fifoesque::types::LogIndex;
//!
//! let mut state = QueueState::new(Config::new("orders"));
//! let meta = Meta::new(LogIndex::new(1), 1_000);
//! let (reply, _effects) = state.apply(
//!     &meta,
//!     Command::Enqueue {
//!         pid: None,
//!         seq: None,
//!         payload: Bytes::from_static(b"hello"),
//!         ttl_ms: None,
//!     },
//! );
//! assert_eq!(reply, Reply::Ok);
//! assert_eq!(state.messages_ready(), 1);
//! ```
//!
//! For an embedding with shared access and snapshot support, see
//! [`machine::FifoMachine`].

#![forbid(unsafe_code)]

pub mod constants;
pub mod error;
pub mod machine;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for embedding the state machine.
    pub use crate::error::{Error, ErrorCode, Result};
    pub use crate::machine::{
        CheckoutSpec, Command, Config, ConsumerIdent, ConsumerRef, CreditMode, Effect, FifoMachine,
        Meta, QueueState, Reply,
    };
    pub use crate::types::{ConsumerKey, LogIndex, MsgId, NodeId, Pid};

    pub use bytes;
}
