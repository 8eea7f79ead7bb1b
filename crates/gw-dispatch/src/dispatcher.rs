use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use gw_channel::DeliveryReceipt;
use gw_common::{DeliveryRequest, ReplyPayload, ThreadId};
use gw_outbox::{EnqueueDelivery, OutboxJournal};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Where the outbox rows of this turn should be aimed.
#[derive(Debug, Clone, Default)]
pub struct DeliveryQueueContext {
    pub channel: String,
    pub to: String,
    pub account_id: Option<String>,
    pub thread_id: Option<ThreadId>,
    pub reply_to_id: Option<String>,
    pub turn_id: Option<String>,
}

/// Direct-send closure: ships one batch of payloads to the already-resolved
/// destination and reports the provider receipt.
pub type DirectSend = Arc<
    dyn Fn(Vec<ReplyPayload>) -> BoxFuture<'static, gw_channel::Result<DeliveryReceipt>>
        + Send
        + Sync,
>;

/// Counters the driver reads after the dispatcher drains.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchCounts {
    pub tool_results: u32,
    pub block_replies: u32,
    pub final_replies: u32,
    /// Final emissions seen, whether or not anything came of them.
    pub attempted_final: u32,
    /// At least one final reply landed somewhere durable or provider-confirmed.
    pub queued_final: bool,
    /// Final replies confirmed sent by the provider.
    pub confirmed_sends: u32,
}

struct DispatcherState {
    queue_ctx: Option<DeliveryQueueContext>,
    closed: bool,
    counts: DispatchCounts,
}

/// Per-turn coordinator between the reply generator and delivery.
///
/// Emissions are processed strictly in the order received (an internal gate
/// serializes concurrent callers). After [`mark_complete`] new emissions are
/// ignored. [`wait_for_idle`] resolves once no emission is in flight.
///
/// [`mark_complete`]: ReplyDispatcher::mark_complete
/// [`wait_for_idle`]: ReplyDispatcher::wait_for_idle
pub struct ReplyDispatcher {
    outbox: Option<Arc<OutboxJournal>>,
    direct: Option<DirectSend>,
    /// Interaction-scoped turns must never attach a queue context: their
    /// provider callback tokens cannot be replayed later.
    interaction_scoped: bool,
    use_idempotency_keys: bool,
    state: Mutex<DispatcherState>,
    gate: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
    idle: Notify,
}

impl ReplyDispatcher {
    /// Dispatcher whose final replies are persisted to the outbox (once a
    /// queue context is attached) and optionally also sent directly.
    pub fn routed(outbox: Arc<OutboxJournal>, direct: Option<DirectSend>) -> Self {
        Self::build(Some(outbox), direct, false)
    }

    /// Dispatcher that only sends directly; nothing is persisted.
    pub fn direct_only(direct: DirectSend) -> Self {
        Self::build(None, Some(direct), false)
    }

    /// Dispatcher for interaction-scoped (native command) turns: direct-only
    /// and immune to queue-context attachment.
    pub fn interaction_scoped(direct: Option<DirectSend>) -> Self {
        Self::build(None, direct, true)
    }

    fn build(
        outbox: Option<Arc<OutboxJournal>>,
        direct: Option<DirectSend>,
        interaction_scoped: bool,
    ) -> Self {
        Self {
            outbox,
            direct,
            interaction_scoped,
            use_idempotency_keys: false,
            state: Mutex::new(DispatcherState {
                queue_ctx: None,
                closed: false,
                counts: DispatchCounts::default(),
            }),
            gate: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Attach idempotency keys to enqueued rows (the target channel declared
    /// `supports_idempotency_key`).
    pub fn with_idempotency_keys(mut self, enabled: bool) -> Self {
        self.use_idempotency_keys = enabled;
        self
    }

    /// True when this dispatcher can persist finals to the outbox.
    pub fn supports_delivery_queue(&self) -> bool {
        self.outbox.is_some() && !self.interaction_scoped
    }

    /// Attach the delivery-queue context. Ignored for interaction-scoped
    /// dispatchers.
    pub fn set_delivery_queue_context(&self, ctx: DeliveryQueueContext) {
        if self.interaction_scoped {
            debug!("Suppressing delivery-queue context for interaction-scoped turn");
            return;
        }
        self.state.lock().queue_ctx = Some(ctx);
    }

    /// Stop accepting emissions. Emissions arriving afterwards are dropped.
    pub fn mark_complete(&self) {
        self.state.lock().closed = true;
    }

    /// Resolve once no emission is being processed.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Snapshot of the counters.
    pub fn counts(&self) -> DispatchCounts {
        self.state.lock().counts
    }

    /// Non-durable intermediate emission.
    pub async fn send_tool_result(&self, payloads: Vec<ReplyPayload>) -> Result<()> {
        let Some(_work) = self.begin_opt() else {
            debug!("Dropping tool result after mark_complete");
            return Ok(());
        };
        let _order = self.gate.lock().await;
        self.state.lock().counts.tool_results += 1;
        self.best_effort_direct(payloads).await;
        Ok(())
    }

    /// Non-durable intermediate emission.
    pub async fn send_block_reply(&self, payloads: Vec<ReplyPayload>) -> Result<()> {
        let Some(_work) = self.begin_opt() else {
            debug!("Dropping block reply after mark_complete");
            return Ok(());
        };
        let _order = self.gate.lock().await;
        self.state.lock().counts.block_replies += 1;
        self.best_effort_direct(payloads).await;
        Ok(())
    }

    /// Durable final emission.
    ///
    /// With a queue context the payloads are persisted as an outbox row
    /// before (and regardless of) the direct send; the row is acked on a
    /// confirmed send and failed on a direct-send error so the outbox-worker
    /// retries it. Without a queue context the direct send is the only path
    /// and its failure is the caller's failure.
    pub async fn send_final_reply(&self, payloads: Vec<ReplyPayload>) -> Result<()> {
        let Some(_work) = self.begin_opt() else {
            debug!("Dropping final reply after mark_complete");
            return Ok(());
        };
        let _order = self.gate.lock().await;

        let queue_ctx = {
            let mut state = self.state.lock();
            state.counts.final_replies += 1;
            state.counts.attempted_final += 1;
            state.queue_ctx.clone()
        };

        match (&self.outbox, queue_ctx) {
            (Some(outbox), Some(ctx)) => {
                let request = delivery_request(&ctx, payloads.clone());
                let idempotency_key = self.use_idempotency_keys.then(|| {
                    let seq = self.state.lock().counts.attempted_final;
                    format!(
                        "{}:{}",
                        ctx.turn_id.as_deref().unwrap_or("system"),
                        seq
                    )
                });
                let enqueued = outbox
                    .enqueue_delivery(EnqueueDelivery {
                        id: None,
                        turn_id: ctx.turn_id.clone(),
                        request,
                        idempotency_key,
                    })
                    .await;

                match enqueued {
                    Ok(row_id) => {
                        self.state.lock().counts.queued_final = true;
                        if let Some(direct) = &self.direct {
                            match direct(payloads).await {
                                Ok(_receipt) => {
                                    let mut state = self.state.lock();
                                    state.counts.confirmed_sends += 1;
                                    drop(state);
                                    if let Err(err) = outbox.ack_delivery(&row_id).await {
                                        warn!(delivery_id = %row_id, error = %err, "Ack after direct send failed");
                                    }
                                }
                                Err(err) => {
                                    // The row stays queued; the worker retries.
                                    if let Err(journal_err) =
                                        outbox.fail_delivery(&row_id, &err.to_string()).await
                                    {
                                        warn!(
                                            delivery_id = %row_id,
                                            error = %journal_err,
                                            "Recording direct-send failure failed"
                                        );
                                    }
                                }
                            }
                        }
                        Ok(())
                    }
                    Err(enqueue_err) => {
                        warn!(error = %enqueue_err, "Outbox enqueue failed for final reply");
                        // Last resort: provider success still counts.
                        if let Some(direct) = &self.direct {
                            if direct(payloads).await.is_ok() {
                                let mut state = self.state.lock();
                                state.counts.confirmed_sends += 1;
                                state.counts.queued_final = true;
                            }
                        }
                        Ok(())
                    }
                }
            }
            _ => {
                let Some(direct) = &self.direct else {
                    warn!("Final reply had neither a queue context nor a direct sender");
                    return Ok(());
                };
                match direct(payloads).await {
                    Ok(_receipt) => {
                        let mut state = self.state.lock();
                        state.counts.confirmed_sends += 1;
                        state.counts.queued_final = true;
                        Ok(())
                    }
                    Err(err) => Err(anyhow::anyhow!("direct final send failed: {err}")),
                }
            }
        }
    }

    async fn best_effort_direct(&self, payloads: Vec<ReplyPayload>) {
        if let Some(direct) = &self.direct {
            if let Err(err) = direct(payloads).await {
                debug!(error = %err, "Best-effort intermediate send failed");
            }
        }
    }

    fn begin_opt(&self) -> Option<WorkGuard<'_>> {
        if self.state.lock().closed {
            return None;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);
        Some(WorkGuard { dispatcher: self })
    }
}

/// Keeps the in-flight count honest on every exit path.
struct WorkGuard<'a> {
    dispatcher: &'a ReplyDispatcher,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        if self.dispatcher.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.dispatcher.idle.notify_waiters();
        }
    }
}

fn delivery_request(ctx: &DeliveryQueueContext, payloads: Vec<ReplyPayload>) -> DeliveryRequest {
    DeliveryRequest {
        channel: ctx.channel.clone(),
        to: ctx.to.clone(),
        account_id: ctx.account_id.clone(),
        payloads,
        thread_id: ctx.thread_id.clone(),
        reply_to_id: ctx.reply_to_id.clone(),
        ..DeliveryRequest::default()
    }
}
