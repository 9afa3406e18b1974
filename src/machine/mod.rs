//! The replicated FIFO queue state machine.
//!
//! [`QueueState::apply`] is the pure core; [`FifoMachine`] is the shared
//! wrapper a replication substrate embeds, adding locking and the
//! snapshot/restore surface.

use std::sync::Arc;
use tokio::sync::RwLock;

mod checkout;
pub mod command;
pub mod config;
pub mod consumer;
pub mod dlx;
pub mod effect;
pub mod enqueuer;
pub mod indexes;
pub mod message;
pub mod queries;
pub mod state;

pub use command::{
    CheckoutReply, CheckoutSpec, Command, ConsumerRef, CreditReply, DequeueReply, DownReason, Meta,
    Reply, ReplyMode, Settlement,
};
pub use config::{Config, ConfigUpdate, ConsumerStrategy, DeadLetterHandler, OverflowStrategy};
pub use consumer::{
    Consumer, ConsumerCfg, ConsumerIdent, ConsumerLifetime, ConsumerStatus, CreditMode,
};
pub use dlx::{DeadLetterReason, DlxCommand};
pub use effect::{
    AuxRequest, DeliveryPlan, Effect, InlineDelivery, MonitorTarget, OutboundMsg, QueueStatus,
    TimerName,
};
pub use enqueuer::{Enqueuer, EnqueuerStatus};
pub use message::{CheckedMsg, Header, MsgRef};
pub use queries::{DlxStats, Overview};
pub use state::{QueueState, ReleaseCursor};

/// Shared state machine handle.
///
/// The substrate applies committed commands through this; queries read
/// through the same lock. Snapshots use the bincode form of the full
/// state.
#[derive(Clone)]
pub struct FifoMachine {
    state: Arc<RwLock<QueueState>>,
}

impl FifoMachine {
    /// Create a machine with a fresh state.
    pub fn new(cfg: Config) -> Self {
        FifoMachine {
            state: Arc::new(RwLock::new(QueueState::new(cfg))),
        }
    }

    /// Get a read-only reference to the current state.
    pub async fn state(&self) -> tokio::sync::RwLockReadGuard<'_, QueueState> {
        self.state.read().await
    }

    /// Get the state Arc for cloning.
    pub fn state_arc(&self) -> Arc<RwLock<QueueState>> {
        self.state.clone()
    }

    /// Apply a committed command.
    pub async fn apply(&self, meta: &Meta, command: Command) -> (Reply, Vec<Effect>) {
        let mut state = self.state.write().await;
        state.apply(meta, command)
    }

    /// Serialize the current state for persistence.
    pub async fn snapshot(&self) -> Vec<u8> {
        let state = self.state.read().await;
        bincode::serialize(&*state).expect("Failed to serialize state")
    }

    /// Restore state from a snapshot. Rehydrates the derived fields a
    /// release-cursor snapshot omits.
    pub async fn restore(&self, snapshot: &[u8]) {
        let mut restored: QueueState =
            bincode::deserialize(snapshot).expect("Failed to deserialize state");
        restored.rehydrate();
        *self.state.write().await = restored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogIndex;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_machine_apply_and_query() {
        let machine = FifoMachine::new(Config::new("q"));
        let meta = Meta::new(LogIndex::new(1), 1000);
        let (reply, _effects) = machine
            .apply(
                &meta,
                Command::Enqueue {
                    pid: None,
                    seq: None,
                    payload: Bytes::from_static(b"m"),
                    ttl_ms: None,
                },
            )
            .await;
        assert_eq!(reply, Reply::Ok);
        assert_eq!(machine.state().await.messages_ready(), 1);
    }

    #[tokio::test]
    async fn test_machine_snapshot_roundtrip() {
        let machine = FifoMachine::new(Config::new("q"));
        let meta = Meta::new(LogIndex::new(1), 1000);
        machine
            .apply(
                &meta,
                Command::Enqueue {
                    pid: None,
                    seq: None,
                    payload: Bytes::from_static(b"m"),
                    ttl_ms: None,
                },
            )
            .await;

        let snapshot = machine.snapshot().await;
        let restored = FifoMachine::new(Config::new("other"));
        restored.restore(&snapshot).await;
        assert_eq!(restored.state().await.cfg.name, "q");
        assert_eq!(restored.state().await.messages_ready(), 1);
    }
}
