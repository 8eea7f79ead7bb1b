//! Gatewire lifecycle server.
//!
//! Runs the two background workers over a state directory: the turn-worker
//! (replays turns that never reached a terminal state) and the outbox-worker
//! (drains retryable deliveries). Inbound dispatch and reply generation live
//! in the embedding application; this binary keeps the durable state moving
//! for deployments where the gateway runs as its own process.
//!
//! ## Configuration
//!
//! Loaded from `gatewire.toml` (see `gw-config` for the search paths) with
//! `GATEWIRE_*` environment overrides:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEWIRE_CONFIG` | - | Explicit config file path |
//! | `GATEWIRE_STATE_DIR` | `./state` | State directory (database + legacy queue) |
//! | `GATEWIRE_DELIVERY_MAX_AGE_MS` | `1800000` | Outbox TTL window |
//! | `GATEWIRE_DELIVERY_EXPIRE_ACTION` | `fail` | `fail` or `deliver` |
//! | `GATEWIRE_OUTBOX_INTERVAL_MS` | `1000` | Outbox worker cadence |
//! | `GATEWIRE_TURN_INTERVAL_MS` | `1200` | Turn worker cadence |
//! | `GATEWIRE_MAX_TURNS_PER_PASS` | `16` | Turn recovery batch size |
//! | `RUST_LOG` | `info` | Log level |

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use gw_channel::OutboundRouter;
use gw_common::MsgContext;
use gw_config::ConfigLoader;
use gw_dispatch::{DispatchDriver, DispatchPolicy, ReplyDispatcher, ReplyResolver};
use gw_outbox::OutboxJournal;
use gw_store::StateStore;
use gw_turns::TurnJournal;
use gw_workers::{OutboxWorker, OutboxWorkerConfig, TurnWorker, TurnWorkerConfig};

/// Stand-in resolver for standalone deployments. Turns that need their reply
/// regenerated are recovery-failed (bounded by the attempt cap) instead of
/// silently dropped; embedders supply the real generator.
struct GeneratorUnavailable;

#[async_trait]
impl ReplyResolver for GeneratorUnavailable {
    async fn resolve(&self, _ctx: &MsgContext, _dispatcher: &ReplyDispatcher) -> Result<()> {
        anyhow::bail!("no reply generator configured in gw-server")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    gw_common::logging::init_logging("gw-server");

    let config = ConfigLoader::new().load()?;
    info!(state_dir = %config.state_dir, "Starting Gatewire lifecycle server");

    let store = StateStore::open(&config.state_dir).await?;
    store.schema().await?;
    if store.is_fallback() {
        warn!("Running on the in-memory fallback store; recovery will not survive restarts");
    }

    let turns = Arc::new(TurnJournal::new(store.clone()));
    let outbox = Arc::new(OutboxJournal::new(store.clone()));
    let router = Arc::new(OutboundRouter::new());
    let driver = Arc::new(DispatchDriver::new(
        turns.clone(),
        outbox.clone(),
        DispatchPolicy {
            finalize_unconfirmed_sends: config.dispatch.finalize_unconfirmed_sends,
        },
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let outbox_worker = OutboxWorker::new(
        outbox.clone(),
        router.clone(),
        PathBuf::from(&config.state_dir),
        OutboxWorkerConfig {
            interval: Duration::from_millis(config.workers.outbox_interval_ms),
            max_age_ms: config.messages.delivery.max_age_ms,
            expire_action: config.messages.delivery.expire_action,
        },
    );
    let outbox_handle = tokio::spawn({
        let shutdown = shutdown_tx.subscribe();
        async move { outbox_worker.run(shutdown).await }
    });

    let turn_worker = TurnWorker::new(
        turns,
        outbox,
        driver,
        Arc::new(GeneratorUnavailable),
        router,
        TurnWorkerConfig {
            interval: Duration::from_millis(config.workers.turn_interval_ms),
            max_turns_per_pass: config.workers.max_turns_per_pass,
        },
    );
    let turn_handle = tokio::spawn({
        let shutdown = shutdown_tx.subscribe();
        async move { turn_worker.run(shutdown).await }
    });

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    let _ = tokio::join!(outbox_handle, turn_handle);

    info!("Gatewire lifecycle server stopped");
    Ok(())
}
