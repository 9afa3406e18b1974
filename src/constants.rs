//! Centralized state machine constants.
//!
//! This module consolidates the magic numbers used throughout the queue
//! state machine so the constraints are documented in one place and can
//! be updated consistently.

// =============================================================================
// Delivery Constants
// =============================================================================

/// Maximum payload bytes batched into a single delivery effect.
///
/// The checkout engine accumulates deliveries per consumer, then chunks
/// them so no single effect carries an unbounded batch. Sizing is based
/// on the message headers' recorded sizes.
pub const DELIVERY_CHUNK_BYTES: u64 = 128 * 1024;

// =============================================================================
// Overflow Constants
// =============================================================================

/// Soft watermark for unblocking publishers under `reject_publish`.
///
/// Once `(ready + dead-lettered, bytes)` falls to this fraction of the
/// hard limit, blocked publishers receive a `go` status message.
pub const REJECT_PUBLISH_RESUME_RATIO: f64 = 0.8;

// =============================================================================
// Release Cursor Constants
// =============================================================================

/// Default base interval (in enqueues) between release cursors.
pub const DEFAULT_RELEASE_CURSOR_INTERVAL: u64 = 2048;

/// Upper bound for the adaptive release cursor interval.
///
/// The effective interval is `clamp(messages_total, base, this)` so a
/// deep backlog does not snapshot on every few enqueues, and an idle
/// queue still emits cursors often enough for the log to be truncated.
pub const RELEASE_CURSOR_INTERVAL_MAX: u64 = 3_200_000;

// =============================================================================
// Machine Versions
// =============================================================================

/// Lowest state shape this machine can rewrite forward.
pub const MACHINE_VERSION_MIN: u8 = 3;

/// The state shape produced by this machine.
///
/// Version 4 keys consumers by attach index and stamps every checked-out
/// message with a delivery deadline.
pub const MACHINE_VERSION: u8 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_is_128_kib() {
        assert_eq!(DELIVERY_CHUNK_BYTES, 131_072);
    }

    #[test]
    fn test_resume_ratio_below_one() {
        assert!(REJECT_PUBLISH_RESUME_RATIO < 1.0);
        assert!(REJECT_PUBLISH_RESUME_RATIO > 0.0);
    }

    #[test]
    fn test_cursor_interval_bounds() {
        assert!(DEFAULT_RELEASE_CURSOR_INTERVAL < RELEASE_CURSOR_INTERVAL_MAX);
    }

    #[test]
    fn test_version_window() {
        assert!(MACHINE_VERSION_MIN <= MACHINE_VERSION);
    }
}
