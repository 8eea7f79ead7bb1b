use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashSet;
use gw_common::{CommandSource, MsgContext, RouteTarget};
use gw_outbox::OutboxJournal;
use gw_turns::{TurnJournal, TurnStatus};
use tracing::{debug, warn};

use crate::dispatcher::{DeliveryQueueContext, DispatchCounts, ReplyDispatcher};

/// Generates the replies for one turn by emitting through the dispatcher.
#[async_trait]
pub trait ReplyResolver: Send + Sync {
    async fn resolve(&self, ctx: &MsgContext, dispatcher: &ReplyDispatcher) -> Result<()>;
}

/// Driver policy knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchPolicy {
    /// Finalize a turn as delivered even when its queued finals have no
    /// provider-confirmed send. Off by default: such turns are left to the
    /// recovery workers.
    pub finalize_unconfirmed_sends: bool,
}

/// What one dispatch produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// False when admission rejected the message as a duplicate.
    pub accepted: bool,
    /// The durable turn, when one was created or resumed.
    pub turn_id: Option<String>,
    pub queued_final: bool,
    pub counts: DispatchCounts,
}

/// Orchestrates one turn: admission, reply generation, dispatcher drain, and
/// turn finalization. One driver serves the whole process; each call handles
/// a single turn.
pub struct DispatchDriver {
    turns: Arc<TurnJournal>,
    outbox: Arc<OutboxJournal>,
    active: Arc<DashSet<String>>,
    policy: DispatchPolicy,
}

impl DispatchDriver {
    pub fn new(
        turns: Arc<TurnJournal>,
        outbox: Arc<OutboxJournal>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            turns,
            outbox,
            active: Arc::new(DashSet::new()),
            policy,
        }
    }

    /// Turns currently being driven in this process. Shared with the
    /// turn-worker so recovery never races a live driver.
    pub fn active_turns(&self) -> Arc<DashSet<String>> {
        self.active.clone()
    }

    pub fn is_turn_active(&self, turn_id: &str) -> bool {
        self.active.contains(turn_id)
    }

    /// Session-scoped abort: every non-terminal turn of the session flips to
    /// aborted and disappears from recovery.
    pub async fn abort_session(&self, session_key: &str) -> Result<u64> {
        self.turns.abort_turns_for_session(session_key).await
    }

    /// Normal inbound path: admit, generate, finalize.
    pub async fn dispatch_inbound_message(
        &self,
        ctx: &MsgContext,
        dispatcher: &ReplyDispatcher,
        resolver: &dyn ReplyResolver,
    ) -> Result<DispatchOutcome> {
        if ctx.is_heartbeat() {
            let result = resolver.resolve(ctx, dispatcher).await;
            dispatcher.mark_complete();
            dispatcher.wait_for_idle().await;
            result?;
            return Ok(DispatchOutcome {
                accepted: true,
                turn_id: None,
                queued_final: dispatcher.counts().queued_final,
                counts: dispatcher.counts(),
            });
        }

        let admission = self.turns.accept_turn(ctx).await?;
        if !admission.accepted {
            debug!("Duplicate inbound message, draining dispatcher");
            dispatcher.mark_complete();
            dispatcher.wait_for_idle().await;
            return Ok(DispatchOutcome {
                accepted: false,
                turn_id: None,
                queued_final: false,
                counts: dispatcher.counts(),
            });
        }

        self.run_turn(&admission.id, ctx, dispatcher, resolver).await
    }

    /// Resume path for crash survivors: the row already exists, so admission
    /// (and with it inbound dedupe) is bypassed.
    pub async fn dispatch_resumed_turn(
        &self,
        turn_id: &str,
        ctx: &MsgContext,
        dispatcher: &ReplyDispatcher,
        resolver: &dyn ReplyResolver,
    ) -> Result<DispatchOutcome> {
        self.run_turn(turn_id, ctx, dispatcher, resolver).await
    }

    async fn run_turn(
        &self,
        turn_id: &str,
        ctx: &MsgContext,
        dispatcher: &ReplyDispatcher,
        resolver: &dyn ReplyResolver,
    ) -> Result<DispatchOutcome> {
        self.active.insert(turn_id.to_string());

        let generation = async {
            self.turns.mark_turn_running(turn_id).await?;

            if ctx.command_source != CommandSource::Native
                && dispatcher.supports_delivery_queue()
            {
                if let Some(route) = RouteTarget::from_context(ctx) {
                    dispatcher.set_delivery_queue_context(DeliveryQueueContext {
                        channel: route.channel,
                        to: route.to,
                        account_id: route.account_id,
                        thread_id: route.thread_id,
                        reply_to_id: route.reply_to_id,
                        turn_id: Some(turn_id.to_string()),
                    });
                }
            }

            resolver.resolve(ctx, dispatcher).await
        }
        .await;

        // The dispatcher is drained on every exit.
        dispatcher.mark_complete();
        dispatcher.wait_for_idle().await;

        let result = match generation {
            Ok(()) => self.finalize(turn_id, dispatcher).await,
            Err(err) => {
                warn!(turn_id = %turn_id, error = %err, "Reply generation failed");
                if let Err(journal_err) = self
                    .turns
                    .record_turn_recovery_failure(
                        turn_id,
                        &format!("reply generation failed: {err}"),
                    )
                    .await
                {
                    warn!(turn_id = %turn_id, error = %journal_err, "Recording recovery failure failed");
                }
                Err(err)
            }
        };

        self.active.remove(turn_id);
        result
    }

    /// Post-drain turn finalization: the outbox aggregate decides first, the
    /// in-process counters settle what the outbox cannot see.
    async fn finalize(
        &self,
        turn_id: &str,
        dispatcher: &ReplyDispatcher,
    ) -> Result<DispatchOutcome> {
        let status = self.outbox.status_for_turn(turn_id).await?;
        let counts = dispatcher.counts();

        if status.queued > 0 {
            self.turns.mark_turn_delivery_pending(turn_id).await?;
        } else if status.delivered > 0 && status.failed == 0 {
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
        } else if counts.attempted_final > 0 && !counts.queued_final {
            self.turns
                .record_turn_recovery_failure(
                    turn_id,
                    "final delivery did not queue successfully",
                )
                .await?;
        } else if counts.attempted_final > 0 {
            if counts.confirmed_sends > 0 || self.policy.finalize_unconfirmed_sends {
                self.turns
                    .finalize_turn(turn_id, TurnStatus::Delivered, Some("final reply sent"))
                    .await?;
            } else {
                self.turns
                    .record_turn_recovery_failure(
                        turn_id,
                        "queued final reply has no confirmed send",
                    )
                    .await?;
            }
        } else {
            // Command-only turn: nothing to deliver is a success.
            self.turns
                .finalize_turn(turn_id, TurnStatus::Delivered, Some("no final reply"))
                .await?;
        }

        Ok(DispatchOutcome {
            accepted: true,
            turn_id: Some(turn_id.to_string()),
            queued_final: counts.queued_final,
            counts,
        })
    }
}
