//! Property-style invariant tests.
//!
//! Scripted sequences assert the documented properties directly;
//! seeded randomized runs sweep broader interleavings. The state's own
//! debug assertions cross-check the internal accounting (index sets,
//! byte counters) on every apply, so these runs exercise them too.

use std::collections::BTreeMap;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fifoesque::machine::{
    CheckoutSpec, Command, Config, ConsumerIdent, ConsumerLifetime, ConsumerRef, CreditMode,
    DeadLetterHandler, Meta, QueueState, Reply,
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

/// Property 1, checked through the public queries.
fn assert_totals(state: &QueueState) {
    let expected =
        state.messages_ready() + state.messages_checked_out() + state.dlx_stats().count;
    assert_eq!(state.messages_total(), expected, "message accounting drifted");
}

// ============================================================================
// Scripted properties
// ============================================================================

#[test]
fn test_settle_is_idempotent() {
    let build = || {
        let mut state = QueueState::new(Config::new("q"));
        state.apply(&meta(1, 1000), enqueue(b"a"));
        state.apply(&meta(2, 1000), enqueue(b"b"));
        let (reply, _) = state.apply(&meta(3, 1001), attach("c1", Pid::new("n1", 1), 10));
        (state, checkout_key(&reply))
    };

    let (mut once, key) = build();
    once.apply(
        &meta(4, 1002),
        Command::Settle {
            consumer: ConsumerRef::Key(key),
            msg_ids: vec![MsgId::new(0)],
        },
    );

    let (mut twice, key) = build();
    twice.apply(
        &meta(4, 1002),
        Command::Settle {
            consumer: ConsumerRef::Key(key),
            msg_ids: vec![MsgId::new(0)],
        },
    );
    twice.apply(
        &meta(5, 1003),
        Command::Settle {
            consumer: ConsumerRef::Key(key),
            msg_ids: vec![MsgId::new(0)],
        },
    );

    assert_eq!(once.messages_total(), twice.messages_total());
    assert_eq!(once.messages_ready(), twice.messages_ready());
    assert_eq!(
        once.consumer_checked_out(key),
        twice.consumer_checked_out(key)
    );
}

#[test]
fn test_fifo_law_single_consumer() {
    let mut state = QueueState::new(Config::new("q"));
    for (i, payload) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
        state.apply(&meta(i as u64 + 1, 1000), enqueue(*payload));
    }
    let (_, effects) = state.apply(&meta(5, 1001), attach("c1", Pid::new("n1", 1), 10));

    let order: Vec<u64> = effects
        .iter()
        .filter_map(|e| match e {
            fifoesque::machine::Effect::LogRead { plan } => {
                Some(plan.msgs.iter().map(|(_, m)| m.index.value()).collect::<Vec<_>>())
            }
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(order, vec![1, 2, 3, 4]);
}

#[test]
fn test_redelivery_uses_strictly_greater_msg_id() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    let (reply, _) = state.apply(&meta(2, 1001), attach("c1", Pid::new("n1", 1), 10));
    let key = checkout_key(&reply);

    let mut last_id = 0u64;
    for round in 0..4u64 {
        let (_, _) = state.apply(
            &meta(3 + round, 1002 + round),
            Command::Return {
                consumer: ConsumerRef::Key(key),
                msg_ids: vec![MsgId::new(last_id)],
            },
        );
        let (&id, _) = state
            .consumer(key)
            .unwrap()
            .checked_out
            .iter()
            .next()
            .expect("message should be redelivered");
        assert!(id.value() > last_id, "msg id must strictly increase");
        last_id = id.value();
    }
}

#[test]
fn test_delivery_count_tracks_returns() {
    let mut state = QueueState::new(Config::new("q"));
    state.apply(&meta(1, 1000), enqueue(b"a"));
    let (reply, _) = state.apply(&meta(2, 1001), attach("c1", Pid::new("n1", 1), 10));
    let key = checkout_key(&reply);

    for k in 1..=3u64 {
        let current: Vec<MsgId> = state
            .consumer(key)
            .unwrap()
            .checked_out
            .keys()
            .copied()
            .collect();
        state.apply(
            &meta(2 + k, 1001 + k),
            Command::Return {
                consumer: ConsumerRef::Key(key),
                msg_ids: current,
            },
        );
        let checked = state
            .consumer(key)
            .unwrap()
            .checked_out
            .values()
            .next()
            .expect("redelivered");
        assert_eq!(u64::from(checked.msg.header.delivery_count()), k);
    }
}

#[test]
fn test_apply_is_deterministic() {
    let script = random_script(0xfeed_beef, 400);

    let mut left = QueueState::new(stress_config());
    let mut right = QueueState::new(stress_config());
    let mut left_effects = Vec::new();
    let mut right_effects = Vec::new();
    for (m, cmd) in &script {
        left_effects.push(left.apply(m, cmd.clone()));
        right_effects.push(right.apply(m, cmd.clone()));
    }
    assert_eq!(left, right);
    assert_eq!(left_effects, right_effects);
}

// ============================================================================
// Randomized sweeps
// ============================================================================

fn stress_config() -> Config {
    let mut cfg = Config::new("stress");
    cfg.delivery_limit = Some(3);
    cfg.max_length = Some(40);
    cfg.msg_ttl = Some(10_000);
    cfg.consumer_lock_ms = Some(30_000);
    cfg.dead_letter_handler = Some(DeadLetterHandler::AtLeastOnce);
    cfg.release_cursor_interval = (8, 8);
    cfg
}

/// Generate a deterministic pseudo-random command script.
fn random_script(seed: u64, len: u64) -> Vec<(Meta, Command)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut script = Vec::new();
    let mut time = 1_000u64;
    let mut publisher_seq = 0u64;
    let mut consumer_keys: Vec<ConsumerKey> = Vec::new();
    let mut next_tag = 0u32;

    for index in 1..=len {
        time += rng.gen_range(0..40);
        let m = meta(index, time);
        let cmd = match rng.gen_range(0..100) {
            0..=29 => {
                if rng.gen_bool(0.5) {
                    let seq = publisher_seq;
                    publisher_seq += 1;
                    Command::Enqueue {
                        pid: Some(Pid::new("pub-node", 1)),
                        seq: Some(seq),
                        payload: Bytes::from_static(b"payload"),
                        ttl_ms: rng.gen_bool(0.2).then(|| rng.gen_range(0..5_000)),
                    }
                } else {
                    enqueue(b"payload")
                }
            }
            30..=37 => {
                next_tag += 1;
                consumer_keys.push(ConsumerKey::new(index));
                attach(
                    &format!("c{next_tag}"),
                    Pid::new("con-node", u64::from(next_tag)),
                    rng.gen_range(1..6),
                )
            }
            38..=57 => Command::Settle {
                consumer: pick_consumer(&mut rng, &consumer_keys),
                msg_ids: pick_msg_ids(&mut rng),
            },
            58..=69 => Command::Return {
                consumer: pick_consumer(&mut rng, &consumer_keys),
                msg_ids: pick_msg_ids(&mut rng),
            },
            70..=75 => Command::Discard {
                consumer: pick_consumer(&mut rng, &consumer_keys),
                msg_ids: pick_msg_ids(&mut rng),
            },
            76..=80 => Command::Credit {
                consumer: pick_consumer(&mut rng, &consumer_keys),
                credit: rng.gen_range(0..8),
                delivery_count: 0,
                drain: rng.gen_bool(0.2),
            },
            81..=85 => Command::ExpireMsgs,
            86..=88 => Command::Defer {
                consumer: pick_consumer(&mut rng, &consumer_keys),
                msg_ids: pick_msg_ids(&mut rng),
            },
            89..=91 => Command::EvalConsumerTimeouts {
                keys: consumer_keys.clone(),
            },
            92..=93 => Command::Down {
                pid: Pid::new("con-node", rng.gen_range(1..4)),
                reason: if rng.gen_bool(0.5) {
                    fifoesque::machine::DownReason::NoConnection
                } else {
                    fifoesque::machine::DownReason::Other("crash".to_string())
                },
            },
            94..=95 => Command::NodeUp {
                node: fifoesque::types::NodeId::new("con-node"),
            },
            96 => Command::Purge,
            97 => Command::Dlx(fifoesque::machine::DlxCommand::AttachWorker {
                pid: Pid::new("dlx-node", 1),
                prefetch: 4,
            }),
            98 => Command::Dlx(fifoesque::machine::DlxCommand::Settle {
                msg_ids: pick_msg_ids(&mut rng),
            }),
            _ => Command::Noop,
        };
        script.push((m, cmd));
    }
    script
}

fn pick_consumer(rng: &mut StdRng, keys: &[ConsumerKey]) -> ConsumerRef {
    if keys.is_empty() {
        ConsumerRef::Key(ConsumerKey::new(9_999))
    } else {
        ConsumerRef::Key(keys[rng.gen_range(0..keys.len())])
    }
}

fn pick_msg_ids(rng: &mut StdRng) -> Vec<MsgId> {
    let count = rng.gen_range(0..4);
    (0..count).map(|_| MsgId::new(rng.gen_range(0..30))).collect()
}

#[test]
fn test_randomized_runs_hold_invariants() {
    for seed in [1u64, 7, 42, 1_000_003] {
        let script = random_script(seed, 500);
        let mut state = QueueState::new(stress_config());
        for (m, cmd) in script {
            state.apply(&m, cmd);
            assert_totals(&state);
        }
    }
}

#[test]
fn test_randomized_runs_without_limits() {
    let mut cfg = Config::new("plain");
    cfg.release_cursor_interval = (4, 4);
    for seed in [3u64, 99] {
        let script = random_script(seed, 300);
        let mut state = QueueState::new(cfg.clone());
        for (m, cmd) in script {
            state.apply(&m, cmd);
            assert_totals(&state);
        }
    }
}
