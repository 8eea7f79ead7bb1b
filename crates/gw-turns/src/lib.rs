//! Turn journal: persistence and state transitions for `message_turns`.
//!
//! One row per admitted inbound turn. Admission deduplicates against a
//! derived key; every later transition is a conditional update that refuses
//! to move a row out of a terminal state.

mod dedupe;
mod journal;
mod record;

pub use dedupe::dedupe_key_for;
pub use journal::{AcceptOutcome, TurnJournal};
pub use record::{TurnRecord, TurnStatus};

/// A turn gets this many recovery attempts before it is failed for good.
pub const MAX_TURN_RECOVERY_ATTEMPTS: i64 = 3;

/// Flat backoff applied between recovery attempts of the same turn.
pub const TURN_RECOVERY_BACKOFF_MS: i64 = 15_000;

/// Turns older than this are never replayed, only failed.
pub const MAX_TURN_RECOVERY_AGE_MS: i64 = 24 * 60 * 60 * 1000;

/// Terminal turns older than this are deleted.
pub const TURN_PRUNE_AGE_MS: i64 = 48 * 60 * 60 * 1000;

/// Recovery ignores turns younger than this so a live in-process driver is
/// not raced for its own turn.
pub const TURN_RECOVERY_MIN_AGE_MS: i64 = 5_000;
