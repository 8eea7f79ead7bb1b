use std::sync::Arc;

use anyhow::Result;
use gw_common::{new_id, now_ms, DeliveryRequest};
use gw_store::StateStore;
use gw_turns::{TurnJournal, TurnStatus};
use tracing::{debug, info, warn};

use crate::backoff::backoff_ms;
use crate::record::{OutboxRecord, OutboxStatus};
use crate::{is_permanent_error, OUTBOX_MAX_RETRIES, OUTBOX_PRUNE_AGE_MS};

const ACTIVE: &str = "('queued', 'failed_retryable')";
const TERMINAL: &str = "('delivered', 'failed_terminal', 'expired')";

/// Parameters for one new outbox row.
#[derive(Debug, Clone, Default)]
pub struct EnqueueDelivery {
    /// Explicit row id; generated when absent.
    pub id: Option<String>,
    /// Owning turn; `None` for system-initiated sends.
    pub turn_id: Option<String>,
    pub request: DeliveryRequest,
    /// Set when the target adapter supports idempotent sends.
    pub idempotency_key: Option<String>,
}

/// Aggregated outbox state of one turn. `queued` counts retryable rows,
/// `failed` counts terminal non-delivered rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnOutboxStatus {
    pub queued: i64,
    pub delivered: i64,
    pub failed: i64,
}

/// Persistence and transitions for `message_outbox`.
///
/// The journal owns row state; it also owns the coupling that finalizes a
/// turn once its last outbox row terminalizes.
pub struct OutboxJournal {
    store: Arc<StateStore>,
    turns: TurnJournal,
}

impl OutboxJournal {
    pub fn new(store: Arc<StateStore>) -> Self {
        let turns = TurnJournal::new(store.clone());
        Self { store, turns }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Insert a new deliverable row in `queued` state.
    ///
    /// With an idempotency key, re-enqueueing the same key returns the
    /// existing row's id instead of inserting a duplicate.
    pub async fn enqueue_delivery(&self, params: EnqueueDelivery) -> Result<String> {
        let id = params.id.unwrap_or_else(new_id);
        let payload = serde_json::to_string(&params.request)?;
        let now = now_ms();

        let done = sqlx::query(
            "INSERT OR IGNORE INTO message_outbox \
             (id, turn_id, channel, account_id, target, payload, idempotency_key, \
              queued_at, status, attempt_count, next_attempt_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'queued', 0, ?)",
        )
        .bind(&id)
        .bind(&params.turn_id)
        .bind(&params.request.channel)
        .bind(&params.request.account_id)
        .bind(&params.request.to)
        .bind(&payload)
        .bind(&params.idempotency_key)
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        if done.rows_affected() == 0 {
            if let Some(key) = &params.idempotency_key {
                let existing: Option<(String,)> =
                    sqlx::query_as("SELECT id FROM message_outbox WHERE idempotency_key = ?")
                        .bind(key)
                        .fetch_optional(self.store.pool())
                        .await?;
                if let Some((existing_id,)) = existing {
                    debug!(
                        delivery_id = %existing_id,
                        "Idempotent enqueue matched an existing delivery"
                    );
                    return Ok(existing_id);
                }
            }
        }

        debug!(
            delivery_id = %id,
            channel = %params.request.channel,
            target = %params.request.to,
            "Delivery enqueued"
        );
        Ok(id)
    }

    /// Rows eligible for a delivery attempt, oldest first.
    ///
    /// `startup_cutoff` hides rows enqueued after process start that have
    /// never been attempted: those belong to live in-process drivers and
    /// must not be double-sent.
    pub async fn load_pending_deliveries(
        &self,
        startup_cutoff: Option<i64>,
    ) -> Result<Vec<OutboxRecord>> {
        let now = now_ms();
        let sql = format!(
            "SELECT * FROM message_outbox \
             WHERE status IN {ACTIVE} AND next_attempt_at <= ? \
               AND NOT (queued_at >= ? AND attempt_count = 0 AND last_attempt_at IS NULL) \
             ORDER BY queued_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(startup_cutoff.unwrap_or(i64::MAX))
            .fetch_all(self.store.pool())
            .await?;

        rows.iter().map(OutboxRecord::from_row).collect()
    }

    /// Mark a row delivered, then finalize the owning turn if this resolved
    /// its outbox.
    pub async fn ack_delivery(&self, id: &str) -> Result<bool> {
        let now = now_ms();
        let sql = format!(
            "UPDATE message_outbox \
             SET status = 'delivered', delivered_at = ?, completed_at = ?, last_error = NULL \
             WHERE id = ? AND status IN {ACTIVE}"
        );
        let done = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(self.store.pool())
            .await?;
        let changed = done.rows_affected() == 1;
        if changed {
            info!(delivery_id = %id, "Delivery acknowledged");
        }

        if let Some(turn_id) = self.turn_id_of(id).await? {
            self.finalize_turn_from_outbox(&turn_id).await?;
        }
        Ok(changed)
    }

    /// Record a failed attempt.
    ///
    /// Permanent provider errors terminalize immediately; transient ones
    /// increment the attempt count and reschedule with backoff until the
    /// retry cap. Returns the resulting status (`None` when the row is
    /// missing or already terminal).
    pub async fn fail_delivery(&self, id: &str, error: &str) -> Result<Option<OutboxStatus>> {
        let row_id = id.to_string();
        let error_text = error.to_string();
        let permanent = is_permanent_error(error);

        let outcome: Option<(OutboxStatus, Option<String>)> = self
            .store
            .transaction(move |conn| {
                Box::pin(async move {
                    let row: Option<(String, i64, Option<String>)> = sqlx::query_as(
                        "SELECT status, attempt_count, turn_id FROM message_outbox WHERE id = ?",
                    )
                    .bind(&row_id)
                    .fetch_optional(&mut *conn)
                    .await?;

                    let Some((status_text, attempts, turn_id)) = row else {
                        return Ok(None);
                    };
                    let current = OutboxStatus::parse(&status_text);
                    if current.map_or(true, |s| s.is_terminal()) {
                        return Ok(None);
                    }

                    let now = now_ms();
                    let new_count = attempts + 1;

                    if permanent {
                        sqlx::query(
                            "UPDATE message_outbox \
                             SET status = 'failed_terminal', attempt_count = ?, \
                                 last_attempt_at = ?, last_error = ?, error_class = 'permanent', \
                                 terminal_reason = ?, completed_at = ? \
                             WHERE id = ?",
                        )
                        .bind(new_count)
                        .bind(now)
                        .bind(&error_text)
                        .bind(&error_text)
                        .bind(now)
                        .bind(&row_id)
                        .execute(&mut *conn)
                        .await?;
                        return Ok(Some((OutboxStatus::FailedTerminal, turn_id)));
                    }

                    if new_count >= OUTBOX_MAX_RETRIES {
                        sqlx::query(
                            "UPDATE message_outbox \
                             SET status = 'failed_terminal', attempt_count = ?, \
                                 last_attempt_at = ?, last_error = ?, error_class = 'terminal', \
                                 terminal_reason = 'retries exhausted', completed_at = ? \
                             WHERE id = ?",
                        )
                        .bind(new_count)
                        .bind(now)
                        .bind(&error_text)
                        .bind(now)
                        .bind(&row_id)
                        .execute(&mut *conn)
                        .await?;
                        return Ok(Some((OutboxStatus::FailedTerminal, turn_id)));
                    }

                    sqlx::query(
                        "UPDATE message_outbox \
                         SET status = 'failed_retryable', attempt_count = ?, \
                             last_attempt_at = ?, last_error = ?, next_attempt_at = ? \
                         WHERE id = ?",
                    )
                    .bind(new_count)
                    .bind(now)
                    .bind(&error_text)
                    .bind(now + backoff_ms(new_count))
                    .bind(&row_id)
                    .execute(&mut *conn)
                    .await?;
                    Ok(Some((OutboxStatus::FailedRetryable, turn_id)))
                })
            })
            .await?;

        let Some((status, turn_id)) = outcome else {
            return Ok(None);
        };

        warn!(delivery_id = %id, status = %status, error = %error, "Delivery failed");
        if status.is_terminal() {
            if let Some(turn_id) = turn_id {
                self.finalize_turn_from_outbox(&turn_id).await?;
            }
        }
        Ok(Some(status))
    }

    /// Terminalize a row with a generic failure reason (retry cap reached or
    /// an unrecoverable worker decision), then run the turn coupling.
    pub async fn move_to_failed(&self, id: &str, reason: &str) -> Result<bool> {
        let now = now_ms();
        let sql = format!(
            "UPDATE message_outbox \
             SET status = 'failed_terminal', error_class = 'terminal', terminal_reason = ?, \
                 completed_at = ? \
             WHERE id = ? AND status IN {ACTIVE}"
        );
        let done = sqlx::query(&sql)
            .bind(reason)
            .bind(now)
            .bind(id)
            .execute(self.store.pool())
            .await?;
        let changed = done.rows_affected() == 1;
        if changed {
            warn!(delivery_id = %id, reason = %reason, "Delivery moved to failed");
        }

        if let Some(turn_id) = self.turn_id_of(id).await? {
            self.finalize_turn_from_outbox(&turn_id).await?;
        }
        Ok(changed)
    }

    /// Expire every active row older than `max_age_ms`.
    pub async fn expire_stale(&self, max_age_ms: i64) -> Result<u64> {
        let now = now_ms();
        let sql = format!(
            "UPDATE message_outbox \
             SET status = 'expired', error_class = 'terminal', terminal_reason = 'expired', \
                 completed_at = ? \
             WHERE status IN {ACTIVE} AND queued_at < ?"
        );
        let done = sqlx::query(&sql)
            .bind(now)
            .bind(now - max_age_ms)
            .execute(self.store.pool())
            .await?;
        if done.rows_affected() > 0 {
            info!(count = done.rows_affected(), "Expired stale deliveries");
        }
        Ok(done.rows_affected())
    }

    /// Expire a single row after its last-chance delivery attempt failed.
    pub async fn expire_delivery(&self, id: &str) -> Result<bool> {
        let now = now_ms();
        let sql = format!(
            "UPDATE message_outbox \
             SET status = 'expired', error_class = 'terminal', terminal_reason = 'expired', \
                 completed_at = ? \
             WHERE id = ? AND status IN {ACTIVE}"
        );
        let done = sqlx::query(&sql)
            .bind(now)
            .bind(id)
            .execute(self.store.pool())
            .await?;

        if let Some(turn_id) = self.turn_id_of(id).await? {
            self.finalize_turn_from_outbox(&turn_id).await?;
        }
        Ok(done.rows_affected() == 1)
    }

    /// Delete terminal rows older than `age_ms`.
    pub async fn prune_outbox(&self, age_ms: i64) -> Result<u64> {
        let cutoff = now_ms() - age_ms;
        let sql = format!(
            "DELETE FROM message_outbox \
             WHERE status IN {TERMINAL} \
               AND COALESCE(completed_at, delivered_at, queued_at) < ?"
        );
        let done = sqlx::query(&sql)
            .bind(cutoff)
            .execute(self.store.pool())
            .await?;
        Ok(done.rows_affected())
    }

    /// Prune with the default 48 h horizon.
    pub async fn prune_outbox_default(&self) -> Result<u64> {
        self.prune_outbox(OUTBOX_PRUNE_AGE_MS).await
    }

    /// Aggregate counters over every row of a turn.
    pub async fn status_for_turn(&self, turn_id: &str) -> Result<TurnOutboxStatus> {
        let (queued, delivered, failed): (i64, i64, i64) = sqlx::query_as(
            "SELECT \
               COALESCE(SUM(CASE WHEN status IN ('queued', 'failed_retryable') THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN status = 'delivered' THEN 1 ELSE 0 END), 0), \
               COALESCE(SUM(CASE WHEN status IN ('failed_terminal', 'expired') THEN 1 ELSE 0 END), 0) \
             FROM message_outbox WHERE turn_id = ?",
        )
        .bind(turn_id)
        .fetch_one(self.store.pool())
        .await?;

        Ok(TurnOutboxStatus {
            queued,
            delivered,
            failed,
        })
    }

    pub async fn get_delivery(&self, id: &str) -> Result<Option<OutboxRecord>> {
        let row = sqlx::query("SELECT * FROM message_outbox WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(OutboxRecord::from_row).transpose()
    }

    async fn turn_id_of(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT turn_id FROM message_outbox WHERE id = ?")
                .bind(id)
                .fetch_optional(self.store.pool())
                .await?;
        Ok(row.and_then(|(turn_id,)| turn_id))
    }

    /// Turn-finalization coupling. Once no active rows remain: any delivery
    /// with no failures finalizes the turn as delivered; any failure
    /// finalizes it as failed. Conditional turn updates make concurrent
    /// callers converge on the same result.
    pub async fn finalize_turn_from_outbox(&self, turn_id: &str) -> Result<()> {
        let status = self.status_for_turn(turn_id).await?;
        if status.queued > 0 {
            return Ok(());
        }
        if status.delivered > 0 && status.failed == 0 {
            self.turns
                .finalize_turn(turn_id, TurnStatus::Delivered, Some("outbox drained"))
                .await?;
        } else if status.failed > 0 {
            self.turns
                .finalize_turn(
                    turn_id,
                    TurnStatus::FailedTerminal,
                    Some("delivery failed terminally"),
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_common::{MsgContext, ReplyPayload};
    use gw_store::StateStore;
    use gw_turns::TurnJournal;

    fn ctx() -> MsgContext {
        MsgContext {
            body: Some("hello".to_string()),
            provider: Some("whatsapp".to_string()),
            account_id: Some("acct-1".to_string()),
            session_key: "agent:whatsapp:+1555".to_string(),
            to: Some("+1555".to_string()),
            message_sid: Some("msg-1".to_string()),
            ..MsgContext::default()
        }
    }

    fn request() -> DeliveryRequest {
        DeliveryRequest {
            channel: "whatsapp".to_string(),
            to: "+1555".to_string(),
            payloads: vec![ReplyPayload::text("hi")],
            ..DeliveryRequest::default()
        }
    }

    async fn journal_with_turn() -> (OutboxJournal, TurnJournal, String) {
        let store = StateStore::open_in_memory().await.unwrap();
        let turns = TurnJournal::new(store.clone());
        let outcome = turns.accept_turn(&ctx()).await.unwrap();
        assert!(outcome.accepted);
        (OutboxJournal::new(store), turns, outcome.id)
    }

    #[tokio::test]
    async fn enqueue_then_load_round_trips_the_request() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let id = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        let pending = journal.load_pending_deliveries(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, OutboxStatus::Queued);
        assert_eq!(pending[0].attempt_count, 0);
        assert!(pending[0].last_attempt_at.is_none());
        assert_eq!(pending[0].request().unwrap(), request());
    }

    #[tokio::test]
    async fn startup_cutoff_hides_live_unattempted_rows() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let cutoff = now_ms() - 60_000;
        journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        // Enqueued after the cutoff and never attempted: invisible.
        assert!(journal
            .load_pending_deliveries(Some(cutoff))
            .await
            .unwrap()
            .is_empty());

        // Without a cutoff it is visible.
        assert_eq!(journal.load_pending_deliveries(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn startup_cutoff_keeps_previously_attempted_rows() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let id = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        journal.fail_delivery(&id, "network timeout").await.unwrap();

        // Attempted once: the cutoff no longer hides it (it is not live).
        // Clear the backoff so the load sees it as due.
        sqlx::query("UPDATE message_outbox SET next_attempt_at = 0 WHERE id = ?")
            .bind(&id)
            .execute(journal.store().pool())
            .await
            .unwrap();
        let pending = journal
            .load_pending_deliveries(Some(now_ms() - 60_000))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_terminalize_at_the_cap() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let id = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        for expected_attempt in 1..OUTBOX_MAX_RETRIES {
            let status = journal
                .fail_delivery(&id, "network timeout")
                .await
                .unwrap()
                .unwrap();
            assert_eq!(status, OutboxStatus::FailedRetryable);

            let row = journal.get_delivery(&id).await.unwrap().unwrap();
            assert_eq!(row.attempt_count, expected_attempt);
            let last = row.last_attempt_at.unwrap();
            assert!(row.next_attempt_at >= last + backoff_ms(expected_attempt));
        }

        let status = journal
            .fail_delivery(&id, "network timeout")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, OutboxStatus::FailedTerminal);

        let row = journal.get_delivery(&id).await.unwrap().unwrap();
        assert_eq!(row.attempt_count, OUTBOX_MAX_RETRIES);
        assert_eq!(row.error_class.as_deref(), Some("terminal"));

        // Retry cap also fails the owning turn.
        let turns = TurnJournal::new(journal.store().clone());
        let turn = turns.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(turn.status, gw_turns::TurnStatus::FailedTerminal);
    }

    #[tokio::test]
    async fn permanent_errors_terminalize_immediately() {
        let (journal, turns, turn_id) = journal_with_turn().await;
        let id = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        let status = journal
            .fail_delivery(&id, "Bad Request: chat not found")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, OutboxStatus::FailedTerminal);

        let row = journal.get_delivery(&id).await.unwrap().unwrap();
        assert_eq!(row.error_class.as_deref(), Some("permanent"));
        assert_eq!(row.attempt_count, 1);

        let turn = turns.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(turn.status, gw_turns::TurnStatus::FailedTerminal);
    }

    #[tokio::test]
    async fn ack_finalizes_the_owning_turn() {
        let (journal, turns, turn_id) = journal_with_turn().await;
        let id = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        assert!(journal.ack_delivery(&id).await.unwrap());
        let row = journal.get_delivery(&id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Delivered);
        assert!(row.delivered_at.is_some());
        assert_eq!(row.delivered_at, row.completed_at);

        let turn = turns.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(turn.status, gw_turns::TurnStatus::Delivered);

        // Idempotent: a second ack changes nothing.
        assert!(!journal.ack_delivery(&id).await.unwrap());
        let again = journal.get_delivery(&id).await.unwrap().unwrap();
        assert_eq!(again.delivered_at, row.delivered_at);
    }

    #[tokio::test]
    async fn ack_waits_for_the_whole_outbox_of_a_turn() {
        let (journal, turns, turn_id) = journal_with_turn().await;
        let first = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        let second = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        journal.ack_delivery(&first).await.unwrap();
        let turn = turns.get_turn(&turn_id).await.unwrap().unwrap();
        assert!(!turn.status.is_terminal());

        journal.ack_delivery(&second).await.unwrap();
        let turn = turns.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(turn.status, gw_turns::TurnStatus::Delivered);
    }

    #[tokio::test]
    async fn mixed_outcome_finalizes_the_turn_as_failed() {
        let (journal, turns, turn_id) = journal_with_turn().await;
        let delivered = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        let failed = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        journal.ack_delivery(&delivered).await.unwrap();
        journal.fail_delivery(&failed, "chat not found").await.unwrap();

        let turn = turns.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(turn.status, gw_turns::TurnStatus::FailedTerminal);
    }

    #[tokio::test]
    async fn move_to_failed_is_idempotent() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let id = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();

        assert!(journal.move_to_failed(&id, "gave up").await.unwrap());
        assert!(!journal.move_to_failed(&id, "gave up").await.unwrap());
        let row = journal.get_delivery(&id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::FailedTerminal);
        assert_eq!(row.terminal_reason.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn expiry_only_touches_old_active_rows() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let old = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        let fresh = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        sqlx::query("UPDATE message_outbox SET queued_at = queued_at - 1900000 WHERE id = ?")
            .bind(&old)
            .execute(journal.store().pool())
            .await
            .unwrap();

        let expired = journal.expire_stale(30 * 60 * 1000).await.unwrap();
        assert_eq!(expired, 1);

        let row = journal.get_delivery(&old).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Expired);
        assert_eq!(row.terminal_reason.as_deref(), Some("expired"));
        let row = journal.get_delivery(&fresh).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Queued);
    }

    #[tokio::test]
    async fn prune_removes_only_old_terminal_rows() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let done = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        let live = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id),
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        journal.ack_delivery(&done).await.unwrap();
        sqlx::query("UPDATE message_outbox SET completed_at = completed_at - 200000000 WHERE id = ?")
            .bind(&done)
            .execute(journal.store().pool())
            .await
            .unwrap();

        let pruned = journal.prune_outbox(OUTBOX_PRUNE_AGE_MS).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(journal.get_delivery(&done).await.unwrap().is_none());
        assert!(journal.get_delivery(&live).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn idempotency_key_collapses_duplicate_enqueues() {
        let (journal, _turns, turn_id) = journal_with_turn().await;
        let first = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id.clone()),
                request: request(),
                idempotency_key: Some("send-1".to_string()),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        let second = journal
            .enqueue_delivery(EnqueueDelivery {
                turn_id: Some(turn_id),
                request: request(),
                idempotency_key: Some("send-1".to_string()),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        assert_eq!(first, second);

        let pending = journal.load_pending_deliveries(None).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn system_sends_have_no_turn_coupling() {
        let store = StateStore::open_in_memory().await.unwrap();
        let journal = OutboxJournal::new(store);
        let id = journal
            .enqueue_delivery(EnqueueDelivery {
                request: request(),
                ..EnqueueDelivery::default()
            })
            .await
            .unwrap();
        assert!(journal.ack_delivery(&id).await.unwrap());
    }
}
