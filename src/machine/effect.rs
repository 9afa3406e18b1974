//! Side-effects returned from `apply`.
//!
//! Effects are the single channel through which the state machine
//! influences the outside world. The replication substrate executes them
//! after the command commits; none of them feed back into state except
//! through future commands.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::machine::message::MsgRef;
use crate::machine::state::QueueState;
use crate::types::{LogIndex, MsgId, NodeId, Pid};

/// What a monitor (or demonitor) effect watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorTarget {
    /// A single client process; failure arrives as a `down` command.
    Process(Pid),
    /// A node; reachability changes arrive as `nodeup`/`nodedown`.
    Node(NodeId),
}

/// Named timers the machine may arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerName {
    /// Fires an `expire_msgs` tick.
    ExpireMsgs,
}

/// Leader-only housekeeping requests for the auxiliary handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxRequest {
    /// Compact retained command bodies.
    GarbageCollection,
}

/// Publisher flow-control notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Stop publishing; the queue is over its limit.
    RejectPublish,
    /// Resume publishing.
    Go,
}

/// A delivery whose body is already in hand (message cache fast path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineDelivery {
    pub msg_id: MsgId,
    pub msg: MsgRef,
    pub body: Bytes,
}

/// Deliveries whose bodies the substrate must fetch from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPlan {
    /// Consumer process to deliver to.
    pub pid: Pid,
    /// Consumer tag.
    pub tag: String,
    /// Messages in delivery order.
    pub msgs: Vec<(MsgId, MsgRef)>,
}

impl DeliveryPlan {
    /// The log indexes the substrate must fetch.
    pub fn indexes(&self) -> Vec<LogIndex> {
        self.msgs.iter().map(|(_, msg)| msg.index).collect()
    }
}

/// Best-effort messages sent to client processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundMsg {
    /// Deliveries with bodies included.
    Delivery {
        tag: String,
        msgs: Vec<InlineDelivery>,
    },

    /// Publisher flow-control transition.
    QueueStatus(QueueStatus),

    /// Credit v2 reply; ordered after the deliveries it accounts for.
    CreditReply {
        tag: String,
        delivery_count: u32,
        credit: u32,
        available: u64,
        drain: bool,
    },

    /// Credit v1 drain completion.
    Drained { tag: String, credit: u32 },

    /// Single-active activation change.
    ConsumerUpdate {
        tag: String,
        active: bool,
        single_active: bool,
    },
}

/// Side-effects the replication substrate interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Send a best-effort message to a process. May be lost; the design
    /// tolerates loss.
    SendMsg { pid: Pid, msg: OutboundMsg },

    /// Start watching a process or node.
    Monitor(MonitorTarget),

    /// Stop watching a process or node.
    Demonitor(MonitorTarget),

    /// Fetch the bodies at `plan.indexes()` and deliver per the plan.
    LogRead { plan: DeliveryPlan },

    /// The log below `index` is summarized by `state` and may be
    /// truncated.
    ReleaseCursor {
        index: LogIndex,
        state: Box<QueueState>,
    },

    /// Arm (Some) or cancel (None) a named timer.
    Timer {
        name: TimerName,
        delay_ms: Option<u64>,
    },

    /// Opaque callback into the embedding host.
    ModCall {
        module: String,
        function: String,
        args: Vec<String>,
    },

    /// Request to the leader-only auxiliary handler.
    Aux(AuxRequest),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::message::Header;

    #[test]
    fn test_delivery_plan_indexes() {
        let plan = DeliveryPlan {
            pid: Pid::new("n1", 1),
            tag: "ctag".to_string(),
            msgs: vec![
                (MsgId::new(0), MsgRef::new(LogIndex::new(4), Header::Size(1))),
                (MsgId::new(1), MsgRef::new(LogIndex::new(9), Header::Size(1))),
            ],
        };
        assert_eq!(plan.indexes(), vec![LogIndex::new(4), LogIndex::new(9)]);
    }

    #[test]
    fn test_effect_roundtrip() {
        let effect = Effect::SendMsg {
            pid: Pid::new("n1", 3),
            msg: OutboundMsg::QueueStatus(QueueStatus::RejectPublish),
        };
        let json = serde_json::to_string(&effect).unwrap();
        assert!(json.contains("reject_publish"));
        let back: Effect = serde_json::from_str(&json).unwrap();
        assert_eq!(effect, back);
    }

    #[test]
    fn test_timer_cancel_shape() {
        let effect = Effect::Timer {
            name: TimerName::ExpireMsgs,
            delay_ms: None,
        };
        let bytes = bincode::serialize(&effect).unwrap();
        let back: Effect = bincode::deserialize(&bytes).unwrap();
        assert_eq!(effect, back);
    }
}
