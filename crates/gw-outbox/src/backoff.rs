use crate::record::OutboxRecord;
use crate::BACKOFF_TABLE_MS;

/// Delay before the next attempt after `attempt_count` failures. Zero
/// failures means no delay; counts beyond the table clamp to its last entry.
pub fn backoff_ms(attempt_count: i64) -> i64 {
    if attempt_count <= 0 {
        return 0;
    }
    let index = ((attempt_count - 1) as usize).min(BACKOFF_TABLE_MS.len() - 1);
    BACKOFF_TABLE_MS[index]
}

/// Whether a pending row may be attempted now.
///
/// A row that has never been tried is always eligible; otherwise its backoff
/// is measured from the later of its last attempt and its enqueue time.
pub fn is_eligible(row: &OutboxRecord, now: i64) -> bool {
    if row.attempt_count == 0 && row.last_attempt_at.is_none() {
        return true;
    }
    let anchor = row.last_attempt_at.unwrap_or(row.queued_at).max(row.queued_at);
    anchor + backoff_ms(row.attempt_count) <= now
}
