//! Static-per-version queue configuration.
//!
//! A [`Config`] is fixed between `update_config` commands; updates merge
//! only the recognized fields and leave everything else untouched, so an
//! updated replica and a stale one converge on the same state once both
//! have applied the same command.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_RELEASE_CURSOR_INTERVAL;

/// What to do when the queue exceeds its length or byte limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Dead-letter messages from the head until under the limit.
    #[default]
    DropHead,
    /// Block known publishers until the queue drains below a watermark.
    RejectPublish,
}

/// Consumer discipline for the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerStrategy {
    /// All attached consumers compete for messages.
    #[default]
    Competing,
    /// Exactly one consumer is active; the rest wait.
    SingleActive,
}

/// Where discarded messages go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterHandler {
    /// Forward discards through an opaque host callback; delivery is not
    /// guaranteed once the effect is handed over.
    AtMostOnce { module: String, function: String },
    /// Retain discards in the state machine until an attached worker
    /// settles them.
    AtLeastOnce,
}

/// Static queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Queue name.
    pub name: String,
    /// Resource identifier the hosting system knows the queue by.
    pub resource: String,
    /// Maximum ready + dead-lettered messages before overflow handling.
    pub max_length: Option<u64>,
    /// Maximum ready + dead-lettered bytes before overflow handling.
    pub max_bytes: Option<u64>,
    /// Returns beyond this count dead-letter the message.
    pub delivery_limit: Option<u32>,
    /// Queue-wide message TTL (ms).
    pub msg_ttl: Option<u64>,
    /// Queue expiry: idle time (ms) with no active consumers after which
    /// the queue asks to be deleted.
    pub expires: Option<u64>,
    /// Consumer lock duration (ms); checked-out messages held longer are
    /// returned by `eval_consumer_timeouts`.
    pub consumer_lock_ms: Option<u64>,
    /// Release cursor interval: (configured base, adaptive current).
    pub release_cursor_interval: (u64, u64),
    /// Overflow behavior.
    pub overflow_strategy: OverflowStrategy,
    /// Consumer discipline.
    pub consumer_strategy: ConsumerStrategy,
    /// Dead-letter handling, if any.
    pub dead_letter_handler: Option<DeadLetterHandler>,
    /// Host callback fired when this replica becomes leader.
    pub become_leader_handler: Option<(String, String)>,
}

impl Config {
    /// A configuration with the given name and all limits off.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Config {
            resource: name.clone(),
            name,
            max_length: None,
            max_bytes: None,
            delivery_limit: None,
            msg_ttl: None,
            expires: None,
            consumer_lock_ms: None,
            release_cursor_interval: (
                DEFAULT_RELEASE_CURSOR_INTERVAL,
                DEFAULT_RELEASE_CURSOR_INTERVAL,
            ),
            overflow_strategy: OverflowStrategy::default(),
            consumer_strategy: ConsumerStrategy::default(),
            dead_letter_handler: None,
            become_leader_handler: None,
        }
    }

    /// Whether the queue uses the single-active consumer discipline.
    #[inline]
    pub fn single_active(&self) -> bool {
        self.consumer_strategy == ConsumerStrategy::SingleActive
    }

    /// Merge an update into this configuration.
    ///
    /// Only fields present in the update change; unrecognized concerns
    /// never reach this struct (the command layer drops them).
    pub fn update(&mut self, update: ConfigUpdate) {
        if let Some(dlh) = update.dead_letter_handler {
            self.dead_letter_handler = dlh;
        }
        if let Some(handler) = update.become_leader_handler {
            self.become_leader_handler = Some(handler);
        }
        if let Some(base) = update.release_cursor_interval {
            // the adaptive current never falls below the configured base
            let current = self.release_cursor_interval.1.max(base);
            self.release_cursor_interval = (base, current);
        }
        if let Some(strategy) = update.overflow_strategy {
            self.overflow_strategy = strategy;
        }
        if let Some(max_length) = update.max_length {
            self.max_length = max_length;
        }
        if let Some(max_bytes) = update.max_bytes {
            self.max_bytes = max_bytes;
        }
        if let Some(delivery_limit) = update.delivery_limit {
            self.delivery_limit = delivery_limit;
        }
        if let Some(expires) = update.expires {
            self.expires = expires;
        }
        if let Some(msg_ttl) = update.msg_ttl {
            self.msg_ttl = msg_ttl;
        }
        if let Some(consumer_lock_ms) = update.consumer_lock_ms {
            self.consumer_lock_ms = consumer_lock_ms;
        }
        if let Some(on) = update.single_active_consumer_on {
            self.consumer_strategy = if on {
                ConsumerStrategy::SingleActive
            } else {
                ConsumerStrategy::Competing
            };
        }
    }
}

/// A partial configuration carried by the `update_config` command.
///
/// `None` means "leave unchanged"; the inner `Option`s on limit fields
/// distinguish "set to unlimited" from "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub dead_letter_handler: Option<Option<DeadLetterHandler>>,
    pub become_leader_handler: Option<(String, String)>,
    pub release_cursor_interval: Option<u64>,
    pub overflow_strategy: Option<OverflowStrategy>,
    pub max_length: Option<Option<u64>>,
    pub max_bytes: Option<Option<u64>>,
    pub delivery_limit: Option<Option<u32>>,
    pub expires: Option<Option<u64>>,
    pub msg_ttl: Option<Option<u64>>,
    pub consumer_lock_ms: Option<Option<u64>>,
    pub single_active_consumer_on: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let cfg = Config::new("orders");
        assert_eq!(cfg.name, "orders");
        assert_eq!(cfg.resource, "orders");
        assert_eq!(cfg.max_length, None);
        assert_eq!(cfg.overflow_strategy, OverflowStrategy::DropHead);
        assert!(!cfg.single_active());
    }

    #[test]
    fn test_update_merges_only_present_fields() {
        let mut cfg = Config::new("orders");
        cfg.update(ConfigUpdate {
            max_length: Some(Some(10)),
            overflow_strategy: Some(OverflowStrategy::RejectPublish),
            ..Default::default()
        });
        assert_eq!(cfg.max_length, Some(10));
        assert_eq!(cfg.overflow_strategy, OverflowStrategy::RejectPublish);
        assert_eq!(cfg.msg_ttl, None);
        assert_eq!(cfg.name, "orders");
    }

    #[test]
    fn test_update_can_clear_a_limit() {
        let mut cfg = Config::new("orders");
        cfg.max_bytes = Some(1024);
        cfg.update(ConfigUpdate {
            max_bytes: Some(None),
            ..Default::default()
        });
        assert_eq!(cfg.max_bytes, None);
    }

    #[test]
    fn test_update_single_active_toggle() {
        let mut cfg = Config::new("orders");
        cfg.update(ConfigUpdate {
            single_active_consumer_on: Some(true),
            ..Default::default()
        });
        assert!(cfg.single_active());
        cfg.update(ConfigUpdate {
            single_active_consumer_on: Some(false),
            ..Default::default()
        });
        assert!(!cfg.single_active());
    }

    #[test]
    fn test_update_dead_letter_handler() {
        let mut cfg = Config::new("orders");
        cfg.update(ConfigUpdate {
            dead_letter_handler: Some(Some(DeadLetterHandler::AtLeastOnce)),
            ..Default::default()
        });
        assert_eq!(cfg.dead_letter_handler, Some(DeadLetterHandler::AtLeastOnce));
        cfg.update(ConfigUpdate {
            dead_letter_handler: Some(None),
            ..Default::default()
        });
        assert_eq!(cfg.dead_letter_handler, None);
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = Config::new("orders");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg, back);
    }
}
