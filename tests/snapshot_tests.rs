//! Snapshot, release-cursor and version-upgrade tests.

use std::collections::BTreeMap;

use bytes::Bytes;
use fifoesque::machine::{
    CheckoutSpec, Command, Config, ConsumerIdent, ConsumerLifetime, ConsumerRef, CreditMode,
    Effect, FifoMachine, Meta, QueueState, Reply,
};
use fifoesque::types::{ConsumerKey, LogIndex, MsgId, Pid};

fn meta(index: u64, time: u64) -> Meta {
    Meta::new(LogIndex::new(index), time)
}

fn enqueue(payload: &'static [u8]) -> Command {
    Command::Enqueue {
        pid: None,
        seq: None,
        payload: Bytes::from_static(payload),
        ttl_ms: None,
    }
}

fn tracked_enqueue(pid: Pid, seq: u64, payload: &'static [u8]) -> Command {
    Command::Enqueue {
        pid: Some(pid),
        seq: Some(seq),
        payload: Bytes::from_static(payload),
        ttl_ms: None,
    }
}

fn attach(tag: &str, pid: Pid, prefetch: u32) -> Command {
    Command::Checkout {
        consumer: ConsumerIdent::new(tag, pid),
        spec: CheckoutSpec::Attach {
            lifetime: ConsumerLifetime::Auto,
            credit_mode: CreditMode::SimplePrefetch { max: prefetch },
        },
        priority: 0,
        meta: BTreeMap::new(),
    }
}

fn checkout_key(reply: &Reply) -> ConsumerKey {
    match reply {
        Reply::Checkout(r) => r.key,
        other => panic!("expected checkout reply, got {other:?}"),
    }
}

fn release_cursors(effects: &[Effect]) -> Vec<(u64, &QueueState)> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::ReleaseCursor { index, state } => Some((index.value(), state.as_ref())),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Dehydration
// ============================================================================

#[test]
fn test_dehydrate_omits_derived_fields() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    state.apply(&meta(2, 1000), enqueue(b"b"));
    assert_eq!(state.smallest_live_index(), Some(LogIndex::new(1)));

    let dehydrated = state.dehydrate();
    // live indexes are derived and omitted from the snapshot form
    assert_eq!(dehydrated.smallest_live_index(), None);
    // the messages themselves round-trip
    assert_eq!(dehydrated.messages_ready(), 2);
    assert_eq!(dehydrated.messages_total(), 2);
}

#[test]
fn test_rehydrate_restores_live_indexes() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    state.apply(&meta(2, 1001), attach("c1", Pid::new("n1", 1), 10));
    state.apply(&meta(3, 1002), enqueue(b"b"));

    let mut restored = state.dehydrate();
    restored.rehydrate();
    // both the checked-out index (1) and the ready index (3) are live
    assert_eq!(restored.smallest_live_index(), Some(LogIndex::new(1)));

    // the restored state keeps working
    let (reply, _) = restored.apply(
        &meta(4, 1003),
        Command::Settle {
            consumer: ConsumerRef::Key(ConsumerKey::new(2)),
            msg_ids: vec![MsgId::new(0), MsgId::new(1)],
        },
    );
    assert_eq!(reply, Reply::Ok);
    assert_eq!(restored.messages_total(), 0);
}

// ============================================================================
// Release cursors
// ============================================================================

#[test]
fn test_cursor_emitted_when_smallest_live_index_passes() {
    let mut cfg = Config::new("q");
    cfg.release_cursor_interval = (2, 2);
    let mut state = QueueState::new(cfg);

    // a registered publisher keeps the queue out of the empty-queue
    // fast path so the staged cursor must gate on the live index
    let publisher = Pid::new("n1", 1);
    state.apply(&meta(1, 1000), tracked_enqueue(publisher.clone(), 0, b"a"));
    let (_, effects) = state.apply(&meta(2, 1001), tracked_enqueue(publisher, 1, b"b"));
    // staged, not yet emitted: indexes 1 and 2 are still live
    assert!(release_cursors(&effects).is_empty());

    let (reply, _) = state.apply(&meta(3, 1002), attach("c1", Pid::new("n2", 1), 10));
    let key = checkout_key(&reply);

    // settling only the first message is not enough (smallest == 2)
    let (_, effects) = state.apply(
        &meta(4, 1003),
        Command::Settle {
            consumer: ConsumerRef::Key(key),
            msg_ids: vec![MsgId::new(0)],
        },
    );
    assert!(release_cursors(&effects).is_empty());

    // settling the second releases the staged cursor at index 2
    let (_, effects) = state.apply(
        &meta(5, 1004),
        Command::Settle {
            consumer: ConsumerRef::Key(key),
            msg_ids: vec![MsgId::new(1)],
        },
    );
    let cursors = release_cursors(&effects);
    assert_eq!(cursors.len(), 1);
    assert_eq!(cursors[0].0, 2);
    // the carried state is dehydrated
    assert_eq!(cursors[0].1.smallest_live_index(), None);
}

#[test]
fn test_drained_queue_emits_fresh_cursor() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    let (reply, _) = state.apply(&meta(2, 1001), attach("c1", Pid::new("n1", 1), 10));
    let key = checkout_key(&reply);

    let (_, effects) = state.apply(
        &meta(3, 1002),
        Command::Settle {
            consumer: ConsumerRef::Key(key),
            msg_ids: vec![MsgId::new(0)],
        },
    );
    // no enqueuers, nothing live: cursor at the settle's own index
    let cursors = release_cursors(&effects);
    assert_eq!(cursors.len(), 1);
    assert_eq!(cursors[0].0, 3);
}

#[test]
fn test_idle_empty_queue_does_not_spam_cursors() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    let (reply, _) = state.apply(&meta(2, 1001), attach("c1", Pid::new("n1", 1), 10));
    let key = checkout_key(&reply);
    state.apply(
        &meta(3, 1002),
        Command::Settle {
            consumer: ConsumerRef::Key(key),
            msg_ids: vec![MsgId::new(0)],
        },
    );

    // repeated idle commands on the drained queue emit nothing new
    let (_, effects) = state.apply(&meta(4, 1003), Command::Noop);
    assert!(release_cursors(&effects).is_empty());
    let (_, effects) = state.apply(&meta(5, 1004), Command::ExpireMsgs);
    assert!(release_cursors(&effects).is_empty());
}

#[test]
fn test_cursor_interval_adapts_to_backlog() {
    let mut cfg = Config::new("q");
    cfg.release_cursor_interval = (2, 2);
    let mut state = QueueState::new(cfg);
    for i in 1..=6u64 {
        state.apply(&meta(i, 1000), enqueue(b"m"));
    }
    // after the staging at enqueue 2 the interval adapted upward to the
    // backlog depth, so later cursors stage less often
    let (base, current) = state.cfg.release_cursor_interval;
    assert_eq!(base, 2);
    assert!(current >= 2);
}

// ============================================================================
// Machine version upgrade
// ============================================================================

#[test]
fn test_upgrade_stamps_checked_out_deadlines() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    let (reply, _) = state.apply(&meta(2, 1000), attach("c1", Pid::new("n1", 1), 10));
    let key = checkout_key(&reply);

    let (reply, _) = state.apply(
        &meta(3, 9999),
        Command::UpgradeMachine { from: 3, to: 4 },
    );
    assert_eq!(reply, Reply::Ok);
    assert_eq!(state.version(), 4);
    let checked = state
        .consumer(key)
        .unwrap()
        .checked_out
        .values()
        .next()
        .unwrap();
    assert_eq!(checked.deadline, 9999);
}

#[test]
fn test_same_version_upgrade_does_not_restamp() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    let (reply, _) = state.apply(&meta(2, 1000), attach("c1", Pid::new("n1", 1), 10));
    let key = checkout_key(&reply);

    state.apply(&meta(3, 9999), Command::UpgradeMachine { from: 4, to: 4 });
    let checked = state
        .consumer(key)
        .unwrap()
        .checked_out
        .values()
        .next()
        .unwrap();
    // delivery deadline unchanged
    assert_eq!(checked.deadline, 1000);
}

// ============================================================================
// Machine wrapper snapshots
// ============================================================================

#[tokio::test]
async fn test_machine_snapshot_restore_roundtrip() {
    let machine = FifoMachine::new(Config::new("q"));
    for i in 1..=3u64 {
        machine.apply(&meta(i, 1000), enqueue(b"m")).await;
    }
    machine
        .apply(&meta(4, 1001), attach("c1", Pid::new("n1", 1), 2))
        .await;

    let snapshot = machine.snapshot().await;
    let restored = FifoMachine::new(Config::new("other"));
    restored.restore(&snapshot).await;

    let state = restored.state().await;
    assert_eq!(state.cfg.name, "q");
    assert_eq!(state.messages_total(), 3);
    assert_eq!(state.messages_ready(), 1);
    assert_eq!(state.messages_checked_out(), 2);
    assert_eq!(state.smallest_live_index(), Some(LogIndex::new(1)));
}

#[test]
fn test_bincode_roundtrip_of_populated_state() {
    let mut state = QueueState::new(Config::new("q"));
    let publisher = Pid::new("n1", 1);
    state.apply(&meta(1, 1000), tracked_enqueue(publisher.clone(), 0, b"a"));
    state.apply(&meta(2, 1000), tracked_enqueue(publisher, 1, b"b"));
    state.apply(&meta(3, 1001), attach("c1", Pid::new("n2", 1), 1));

    let bytes = bincode::serialize(&state).unwrap();
    let back: QueueState = bincode::deserialize(&bytes).unwrap();
    assert_eq!(state, back);
}
