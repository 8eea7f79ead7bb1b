//! Outbox journal: persistence and state transitions for `message_outbox`.
//!
//! Each row is one deliverable final payload. Rows retry with a fixed
//! backoff table until they deliver, exhaust their attempts, hit a permanent
//! provider error, or age out of the delivery window. Terminalizing the last
//! row of a turn finalizes the turn itself.

mod backoff;
mod journal;
mod legacy;
mod record;

pub use backoff::{backoff_ms, is_eligible};
pub use journal::{EnqueueDelivery, OutboxJournal, TurnOutboxStatus};
pub use legacy::import_legacy_file_queue;
pub use record::{OutboxRecord, OutboxStatus};

/// Delivery attempts per row before the row is failed terminally.
pub const OUTBOX_MAX_RETRIES: i64 = 5;

/// Backoff table indexed by attempt count; later attempts clamp to the last
/// entry.
pub const BACKOFF_TABLE_MS: [i64; 4] = [5_000, 25_000, 120_000, 600_000];

/// Default delivery window: rows older than this expire undelivered.
pub const DEFAULT_DELIVERY_MAX_AGE_MS: i64 = 30 * 60 * 1000;

/// Terminal outbox rows older than this are deleted.
pub const OUTBOX_PRUNE_AGE_MS: i64 = 48 * 60 * 60 * 1000;

/// Provider errors that can never succeed on retry, matched
/// case-insensitively against the error text.
pub const PERMANENT_ERROR_PATTERNS: &[&str] = &[
    "no conversation reference found",
    "chat not found",
    "user not found",
    "bot was blocked by the user",
    "forbidden: bot was kicked",
    "chat_id is empty",
    "recipient is not a valid",
    "outbound not configured for channel",
];

/// True when the error text matches a permanent pattern.
pub fn is_permanent_error(error: &str) -> bool {
    let lowered = error.to_lowercase();
    PERMANENT_ERROR_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanent_patterns_match_case_insensitively() {
        assert!(is_permanent_error("Bad Request: Chat Not Found"));
        assert!(is_permanent_error("403 Forbidden: bot was kicked from the group"));
        assert!(is_permanent_error("outbound not configured for channel discord"));
        assert!(!is_permanent_error("network timeout"));
        assert!(!is_permanent_error("connection reset by peer"));
        // Cancellation is transient: the row must survive for a retry.
        assert!(!is_permanent_error("delivery cancelled"));
    }
}
