use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gw_channel::OutboundRouter;
use gw_common::now_ms;
use gw_config::ExpireAction;
use gw_outbox::{
    import_legacy_file_queue, is_eligible, OutboxJournal, DEFAULT_DELIVERY_MAX_AGE_MS,
    OUTBOX_MAX_RETRIES,
};
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    /// Pass cadence. The per-pass wall budget is 3/4 of this.
    pub interval: Duration,
    /// Delivery TTL window.
    pub max_age_ms: i64,
    /// What to do with rows past the TTL.
    pub expire_action: ExpireAction,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            max_age_ms: DEFAULT_DELIVERY_MAX_AGE_MS,
            expire_action: ExpireAction::Fail,
        }
    }
}

/// Counters from one worker pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxPassStats {
    pub imported: u64,
    pub expired: u64,
    pub delivered: u64,
    pub failed: u64,
    pub deferred: u64,
    pub pruned: u64,
}

/// Drains eligible outbox rows through the outbound router.
pub struct OutboxWorker {
    journal: Arc<OutboxJournal>,
    router: Arc<OutboundRouter>,
    config: OutboxWorkerConfig,
    state_dir: PathBuf,
    /// Rows enqueued after this instant that were never attempted belong to
    /// live drivers and are invisible to the worker.
    startup_cutoff: i64,
    legacy_imported: AtomicBool,
}

impl OutboxWorker {
    pub fn new(
        journal: Arc<OutboxJournal>,
        router: Arc<OutboundRouter>,
        state_dir: PathBuf,
        config: OutboxWorkerConfig,
    ) -> Self {
        Self {
            journal,
            router,
            config,
            state_dir,
            startup_cutoff: now_ms(),
            legacy_imported: AtomicBool::new(false),
        }
    }

    /// Test hook: pretend the process started at `cutoff`.
    pub fn with_startup_cutoff(mut self, cutoff: i64) -> Self {
        self.startup_cutoff = cutoff;
        self
    }

    /// Run until the shutdown channel fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_age_ms = self.config.max_age_ms,
            "Starting outbox worker"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.run_once().await;
                    debug!(
                        delivered = stats.delivered,
                        failed = stats.failed,
                        deferred = stats.deferred,
                        expired = stats.expired,
                        pruned = stats.pruned,
                        "Outbox worker pass complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Outbox worker shutting down");
                    return;
                }
            }
        }
    }

    /// One full pass. Errors are logged and accounted, never raised.
    pub async fn run_once(&self) -> OutboxPassStats {
        let mut stats = OutboxPassStats::default();

        if !self.legacy_imported.swap(true, Ordering::SeqCst) {
            match import_legacy_file_queue(&self.journal, &self.state_dir).await {
                Ok(count) => stats.imported = count,
                Err(err) => error!(error = %err, "Legacy file-queue import failed"),
            }
        }

        if self.config.expire_action == ExpireAction::Fail {
            match self.journal.expire_stale(self.config.max_age_ms).await {
                Ok(count) => stats.expired = count,
                Err(err) => error!(error = %err, "Outbox TTL expiry failed"),
            }
        }

        let rows = match self
            .journal
            .load_pending_deliveries(Some(self.startup_cutoff))
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, "Loading pending deliveries failed");
                return stats;
            }
        };

        let deadline = Instant::now() + (self.config.interval * 3) / 4;
        let mut remaining = rows.len() as u64;

        for row in rows {
            if Instant::now() >= deadline {
                stats.deferred += remaining;
                debug!(deferred = remaining, "Outbox pass deadline reached");
                break;
            }
            remaining -= 1;

            let now = now_ms();
            if row.attempt_count >= OUTBOX_MAX_RETRIES {
                if let Err(err) = self
                    .journal
                    .move_to_failed(&row.id, "retries exhausted")
                    .await
                {
                    error!(delivery_id = %row.id, error = %err, "Moving delivery to failed failed");
                }
                stats.failed += 1;
                continue;
            }
            if !is_eligible(&row, now) {
                stats.deferred += 1;
                continue;
            }

            let request = match row.request() {
                Ok(request) => request,
                Err(err) => {
                    warn!(delivery_id = %row.id, error = %err, "Undecodable delivery payload");
                    if let Err(journal_err) = self
                        .journal
                        .move_to_failed(&row.id, "invalid delivery payload")
                        .await
                    {
                        error!(delivery_id = %row.id, error = %journal_err, "Moving delivery to failed failed");
                    }
                    stats.failed += 1;
                    continue;
                }
            };

            // Past the TTL with expire_action=deliver this is the last chance.
            let last_chance = self.config.expire_action == ExpireAction::Deliver
                && row.queued_at < now - self.config.max_age_ms;

            match self.router.deliver(&request).await {
                Ok(receipt) => {
                    debug!(
                        delivery_id = %row.id,
                        sent = receipt.sent,
                        "Recovered delivery sent"
                    );
                    if let Err(err) = self.journal.ack_delivery(&row.id).await {
                        error!(delivery_id = %row.id, error = %err, "Ack failed");
                    }
                    stats.delivered += 1;
                }
                Err(send_err) => {
                    let result = if last_chance {
                        stats.expired += 1;
                        self.journal.expire_delivery(&row.id).await.map(|_| ())
                    } else {
                        stats.failed += 1;
                        self.journal
                            .fail_delivery(&row.id, &send_err.to_string())
                            .await
                            .map(|_| ())
                    };
                    if let Err(err) = result {
                        error!(delivery_id = %row.id, error = %err, "Recording delivery failure failed");
                    }
                }
            }
        }

        match self.journal.prune_outbox_default().await {
            Ok(count) => stats.pruned = count,
            Err(err) => error!(error = %err, "Outbox pruning failed"),
        }

        stats
    }
}
