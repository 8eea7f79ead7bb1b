use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use gw_channel::{DeliveryReceipt, OutboundRouter};
use gw_common::{DeliveryRequest, ReplyPayload, RouteTarget};
use gw_dispatch::{DirectSend, DispatchDriver, ReplyDispatcher, ReplyResolver};
use gw_outbox::OutboxJournal;
use gw_turns::{
    TurnJournal, TurnStatus, MAX_TURN_RECOVERY_AGE_MS, TURN_RECOVERY_MIN_AGE_MS,
};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TurnWorkerConfig {
    pub interval: Duration,
    pub max_turns_per_pass: u32,
}

impl Default for TurnWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1200),
            max_turns_per_pass: 16,
        }
    }
}

/// Counters from one worker pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnPassStats {
    pub stale_failed: u64,
    pub finalized: u64,
    pub resumed: u64,
    pub recovery_failures: u64,
    pub skipped_active: u64,
    pub pruned: u64,
}

/// Replays turns that never reached a terminal state.
pub struct TurnWorker {
    turns: Arc<TurnJournal>,
    outbox: Arc<OutboxJournal>,
    driver: Arc<DispatchDriver>,
    resolver: Arc<dyn ReplyResolver>,
    router: Arc<OutboundRouter>,
    config: TurnWorkerConfig,
}

impl TurnWorker {
    pub fn new(
        turns: Arc<TurnJournal>,
        outbox: Arc<OutboxJournal>,
        driver: Arc<DispatchDriver>,
        resolver: Arc<dyn ReplyResolver>,
        router: Arc<OutboundRouter>,
        config: TurnWorkerConfig,
    ) -> Self {
        Self {
            turns,
            outbox,
            driver,
            resolver,
            router,
            config,
        }
    }

    /// Run until the shutdown channel fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_turns_per_pass = self.config.max_turns_per_pass,
            "Starting turn worker"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.run_once().await;
                    debug!(
                        resumed = stats.resumed,
                        finalized = stats.finalized,
                        recovery_failures = stats.recovery_failures,
                        stale_failed = stats.stale_failed,
                        pruned = stats.pruned,
                        "Turn worker pass complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Turn worker shutting down");
                    return;
                }
            }
        }
    }

    /// One full pass. Errors are logged and accounted, never raised.
    pub async fn run_once(&self) -> TurnPassStats {
        let mut stats = TurnPassStats::default();

        match self.turns.fail_stale_turns(MAX_TURN_RECOVERY_AGE_MS).await {
            Ok(count) => stats.stale_failed = count,
            Err(err) => error!(error = %err, "Stale turn sweep failed"),
        }

        let rows = match self
            .turns
            .list_recoverable_turns(
                TURN_RECOVERY_MIN_AGE_MS,
                MAX_TURN_RECOVERY_AGE_MS,
                self.config.max_turns_per_pass,
            )
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "Listing recoverable turns failed");
                return stats;
            }
        };

        for row in rows {
            if self.driver.is_turn_active(&row.id) {
                stats.skipped_active += 1;
                continue;
            }

            // Let the outbox aggregate settle the turn when it already can.
            let status = match self.outbox.status_for_turn(&row.id).await {
                Ok(status) => status,
                Err(err) => {
                    error!(turn_id = %row.id, error = %err, "Reading outbox status failed");
                    continue;
                }
            };
            if status.queued > 0 {
                // Deliveries are still pending; the outbox-worker owns this.
                continue;
            }
            if status.delivered > 0 || status.failed > 0 {
                let (terminal, reason) = if status.failed > 0 {
                    (TurnStatus::FailedTerminal, "delivery failed terminally")
                } else {
                    (TurnStatus::Delivered, "outbox drained")
                };
                match self.turns.finalize_turn(&row.id, terminal, Some(reason)).await {
                    Ok(true) => stats.finalized += 1,
                    Ok(false) => {}
                    Err(err) => {
                        error!(turn_id = %row.id, error = %err, "Finalizing turn failed")
                    }
                }
                continue;
            }

            // No outbox trace: the reply generation itself must be replayed.
            let Some((ctx, route)) = row.hydrate() else {
                warn!(turn_id = %row.id, "Turn payload could not be hydrated");
                match self
                    .turns
                    .record_turn_recovery_failure(&row.id, "invalid turn payload")
                    .await
                {
                    Ok(_) => stats.recovery_failures += 1,
                    Err(err) => {
                        error!(turn_id = %row.id, error = %err, "Recording recovery failure failed")
                    }
                }
                continue;
            };

            debug!(turn_id = %row.id, channel = %route.channel, "Resuming turn");
            let dispatcher =
                ReplyDispatcher::direct_only(route_sender(self.router.clone(), route));
            match self
                .driver
                .dispatch_resumed_turn(&row.id, &ctx, &dispatcher, self.resolver.as_ref())
                .await
            {
                Ok(_) => stats.resumed += 1,
                Err(err) => {
                    // The driver already recorded the recovery failure.
                    warn!(turn_id = %row.id, error = %err, "Turn resume failed");
                    stats.recovery_failures += 1;
                }
            }
        }

        match self.turns.prune_turns_default().await {
            Ok(count) => stats.pruned = count,
            Err(err) => error!(error = %err, "Turn pruning failed"),
        }

        stats
    }
}

/// Direct-send closure aimed at the captured route of a resumed turn.
fn route_sender(router: Arc<OutboundRouter>, route: RouteTarget) -> DirectSend {
    Arc::new(move |payloads: Vec<ReplyPayload>| {
        let router = router.clone();
        let route = route.clone();
        let fut: BoxFuture<'static, gw_channel::Result<DeliveryReceipt>> = Box::pin(async move {
            let request = DeliveryRequest {
                channel: route.channel,
                to: route.to,
                account_id: route.account_id,
                payloads,
                thread_id: route.thread_id,
                reply_to_id: route.reply_to_id,
                ..DeliveryRequest::default()
            };
            router.deliver(&request).await
        });
        fut
    })
}
