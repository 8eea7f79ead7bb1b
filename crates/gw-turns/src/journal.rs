use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use gw_common::{new_id, now_ms, MsgContext, RouteTarget};
use gw_store::StateStore;
use tracing::{debug, info, warn};

use crate::dedupe::{dedupe_key_for, FallbackCache};
use crate::record::{TurnRecord, TurnStatus};
use crate::{
    MAX_TURN_RECOVERY_ATTEMPTS, TURN_PRUNE_AGE_MS, TURN_RECOVERY_BACKOFF_MS,
};

const NON_TERMINAL: &str = "('accepted', 'running', 'delivery_pending', 'failed_retryable')";
const TERMINAL: &str = "('delivered', 'aborted', 'failed_terminal')";

const DB_WARN_INTERVAL_MS: i64 = 60_000;

/// Admission result: `accepted == false` means the message was a duplicate.
#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub accepted: bool,
    pub id: String,
}

/// Persistence and transitions for `message_turns`.
pub struct TurnJournal {
    store: Arc<StateStore>,
    fallback: FallbackCache,
    last_db_warn_ms: AtomicI64,
}

impl TurnJournal {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            fallback: FallbackCache::default(),
            last_db_warn_ms: AtomicI64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Admit an inbound turn with a generated id.
    pub async fn accept_turn(&self, ctx: &MsgContext) -> Result<AcceptOutcome> {
        self.accept_turn_with_id(ctx, new_id()).await
    }

    /// Admit an inbound turn under a caller-supplied id.
    ///
    /// Dedupe is keyed on the derived dedupe key when one is computable;
    /// otherwise the insert is unconditional. A database failure degrades to
    /// the in-memory fallback cache (or fails open without a computable key).
    pub async fn accept_turn_with_id(
        &self,
        ctx: &MsgContext,
        id: String,
    ) -> Result<AcceptOutcome> {
        let dedupe_key = dedupe_key_for(ctx);
        let payload = serde_json::to_string(ctx)?;
        let route = RouteTarget::from_context(ctx);
        let channel = ctx
            .resolved_provider()
            .unwrap_or_else(|| "unknown".to_string());
        let now = now_ms();

        let verb = if dedupe_key.is_some() {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };
        let sql = format!(
            "{verb} INTO message_turns \
             (id, channel, account_id, external_id, dedupe_key, session_key, payload, \
              route_channel, route_to, route_account_id, route_thread_id, route_reply_to_id, \
              status, accepted_at, updated_at, attempt_count, next_attempt_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?)"
        );

        let result = sqlx::query(&sql)
            .bind(&id)
            .bind(&channel)
            .bind(&ctx.account_id)
            .bind(&ctx.message_sid)
            .bind(&dedupe_key)
            .bind(&ctx.session_key)
            .bind(&payload)
            .bind(route.as_ref().map(|r| r.channel.as_str()))
            .bind(route.as_ref().map(|r| r.to.as_str()))
            .bind(route.as_ref().and_then(|r| r.account_id.as_deref()))
            .bind(
                route
                    .as_ref()
                    .and_then(|r| r.thread_id.as_ref())
                    .map(|t| t.as_key()),
            )
            .bind(route.as_ref().and_then(|r| r.reply_to_id.as_deref()))
            .bind(TurnStatus::Accepted.as_str())
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(self.store.pool())
            .await;

        match result {
            Ok(done) => {
                let accepted = dedupe_key.is_none() || done.rows_affected() == 1;
                if accepted {
                    debug!(turn_id = %id, channel = %channel, "Turn admitted");
                } else {
                    debug!(turn_id = %id, channel = %channel, "Duplicate turn rejected");
                }
                Ok(AcceptOutcome { accepted, id })
            }
            Err(err) => {
                self.warn_db_failure(&err);
                let accepted = match &dedupe_key {
                    Some(_) => self.fallback.admit(
                        &channel,
                        ctx.account_id.as_deref().unwrap_or_default(),
                        ctx.message_sid.as_deref().unwrap_or_default(),
                    ),
                    // Nothing to key on: fail open.
                    None => true,
                };
                Ok(AcceptOutcome { accepted, id })
            }
        }
    }

    /// `accepted`/`failed_retryable` → `running`.
    pub async fn mark_turn_running(&self, id: &str) -> Result<bool> {
        let sql = "UPDATE message_turns SET status = 'running', updated_at = ? \
                   WHERE id = ? AND status IN ('accepted', 'failed_retryable')";
        let done = sqlx::query(sql)
            .bind(now_ms())
            .bind(id)
            .execute(self.store.pool())
            .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Any non-terminal state → `delivery_pending`.
    pub async fn mark_turn_delivery_pending(&self, id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE message_turns SET status = 'delivery_pending', updated_at = ? \
             WHERE id = ? AND status IN {NON_TERMINAL}"
        );
        let done = sqlx::query(&sql)
            .bind(now_ms())
            .bind(id)
            .execute(self.store.pool())
            .await?;
        Ok(done.rows_affected() == 1)
    }

    /// Move a non-terminal turn into a terminal state. No-op (false) when the
    /// row is already terminal or missing.
    pub async fn finalize_turn(
        &self,
        id: &str,
        status: TurnStatus,
        reason: Option<&str>,
    ) -> Result<bool> {
        anyhow::ensure!(
            status.is_terminal(),
            "finalize_turn requires a terminal status, got {status}"
        );
        let now = now_ms();
        let sql = format!(
            "UPDATE message_turns \
             SET status = ?, terminal_reason = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status IN {NON_TERMINAL}"
        );
        let done = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(reason)
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(self.store.pool())
            .await?;
        let changed = done.rows_affected() == 1;
        if changed {
            info!(turn_id = %id, status = %status, "Turn finalized");
        }
        Ok(changed)
    }

    /// Record a failed recovery attempt. The turn goes back to
    /// `failed_retryable` with backoff until the attempt cap, at which point
    /// it is failed terminally. Returns the resulting status, or `None` when
    /// the row is missing or already terminal.
    pub async fn record_turn_recovery_failure(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<Option<TurnStatus>> {
        let turn_id = id.to_string();
        let reason = reason.to_string();

        let outcome = self
            .store
            .transaction(move |conn| {
                Box::pin(async move {
                    let row: Option<(String, i64, i64)> = sqlx::query_as(
                        "SELECT status, attempt_count, next_attempt_at \
                         FROM message_turns WHERE id = ?",
                    )
                    .bind(&turn_id)
                    .fetch_optional(&mut *conn)
                    .await?;

                    let Some((status_text, attempts, next_attempt_at)) = row else {
                        return Ok(None);
                    };
                    let current = TurnStatus::parse(&status_text);
                    if current.map_or(true, |s| s.is_terminal()) {
                        return Ok(None);
                    }

                    let now = now_ms();
                    let new_count = attempts + 1;
                    if new_count >= MAX_TURN_RECOVERY_ATTEMPTS {
                        sqlx::query(
                            "UPDATE message_turns \
                             SET status = 'failed_terminal', attempt_count = ?, \
                                 terminal_reason = ?, completed_at = ?, updated_at = ? \
                             WHERE id = ?",
                        )
                        .bind(new_count)
                        .bind(&reason)
                        .bind(now)
                        .bind(now)
                        .bind(&turn_id)
                        .execute(&mut *conn)
                        .await?;
                        Ok(Some(TurnStatus::FailedTerminal))
                    } else {
                        // next_attempt_at never moves backwards.
                        let next = (now + TURN_RECOVERY_BACKOFF_MS).max(next_attempt_at);
                        sqlx::query(
                            "UPDATE message_turns \
                             SET status = 'failed_retryable', attempt_count = ?, \
                                 next_attempt_at = ?, updated_at = ? \
                             WHERE id = ?",
                        )
                        .bind(new_count)
                        .bind(next)
                        .bind(now)
                        .bind(&turn_id)
                        .execute(&mut *conn)
                        .await?;
                        Ok(Some(TurnStatus::FailedRetryable))
                    }
                })
            })
            .await?;

        if let Some(status) = outcome {
            warn!(turn_id = %id, status = %status, "Turn recovery failure recorded");
        }
        Ok(outcome)
    }

    /// Terminally fail every non-terminal turn older than `max_age_ms`.
    pub async fn fail_stale_turns(&self, max_age_ms: i64) -> Result<u64> {
        let now = now_ms();
        let sql = format!(
            "UPDATE message_turns \
             SET status = 'failed_terminal', terminal_reason = 'stale turn exceeded recovery age', \
                 completed_at = ?, updated_at = ? \
             WHERE status IN {NON_TERMINAL} AND accepted_at < ?"
        );
        let done = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(now - max_age_ms)
            .execute(self.store.pool())
            .await?;
        if done.rows_affected() > 0 {
            info!(count = done.rows_affected(), "Failed stale turns");
        }
        Ok(done.rows_affected())
    }

    /// Abort every non-terminal turn of a session.
    pub async fn abort_turns_for_session(&self, session_key: &str) -> Result<u64> {
        let now = now_ms();
        let sql = format!(
            "UPDATE message_turns \
             SET status = 'aborted', terminal_reason = 'superseded by session abort', \
                 completed_at = ?, updated_at = ? \
             WHERE session_key = ? AND status IN {NON_TERMINAL}"
        );
        let done = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(session_key)
            .execute(self.store.pool())
            .await?;
        if done.rows_affected() > 0 {
            info!(
                session_key = %session_key,
                count = done.rows_affected(),
                "Aborted turns for session"
            );
        }
        Ok(done.rows_affected())
    }

    /// Delete terminal turns older than `age_ms`.
    pub async fn prune_turns(&self, age_ms: i64) -> Result<u64> {
        let cutoff = now_ms() - age_ms;
        let sql = format!(
            "DELETE FROM message_turns \
             WHERE status IN {TERMINAL} \
               AND COALESCE(completed_at, updated_at, accepted_at) < ?"
        );
        let done = sqlx::query(&sql)
            .bind(cutoff)
            .execute(self.store.pool())
            .await?;
        Ok(done.rows_affected())
    }

    /// Prune with the default 48 h horizon.
    pub async fn prune_turns_default(&self) -> Result<u64> {
        self.prune_turns(TURN_PRUNE_AGE_MS).await
    }

    /// Non-terminal turns due for recovery: accepted between `max_age_ms` and
    /// `min_age_ms` ago, with their backoff elapsed, oldest first.
    pub async fn list_recoverable_turns(
        &self,
        min_age_ms: i64,
        max_age_ms: i64,
        limit: u32,
    ) -> Result<Vec<TurnRecord>> {
        let now = now_ms();
        let sql = format!(
            "SELECT * FROM message_turns \
             WHERE status IN {NON_TERMINAL} \
               AND accepted_at >= ? AND accepted_at <= ? \
               AND next_attempt_at <= ? \
             ORDER BY accepted_at ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(now - max_age_ms)
            .bind(now - min_age_ms)
            .bind(now)
            .bind(limit)
            .fetch_all(self.store.pool())
            .await?;

        rows.iter().map(TurnRecord::from_row).collect()
    }

    pub async fn get_turn(&self, id: &str) -> Result<Option<TurnRecord>> {
        let row = sqlx::query("SELECT * FROM message_turns WHERE id = ?")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(TurnRecord::from_row).transpose()
    }

    fn warn_db_failure(&self, err: &sqlx::Error) {
        let now = now_ms();
        let last = self.last_db_warn_ms.load(Ordering::Relaxed);
        if now - last >= DB_WARN_INTERVAL_MS
            && self
                .last_db_warn_ms
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                error = %err,
                "Turn admission database failure, deduping from in-memory cache"
            );
        }
    }
}
