//! End-to-end recovery scenarios across the journals, workers, and a fake
//! channel adapter.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gw_channel::{ChannelAdapter, ChannelError, DeliveryReceipt, OutboundRouter, SendFinal};
use gw_common::{DeliveryRequest, MsgContext, ReplyPayload};
use gw_dispatch::{DispatchDriver, DispatchPolicy, ReplyDispatcher, ReplyResolver};
use gw_outbox::{EnqueueDelivery, OutboxJournal, OutboxStatus};
use gw_store::StateStore;
use gw_turns::{TurnJournal, TurnStatus};
use gw_workers::{OutboxWorker, OutboxWorkerConfig, TurnWorker, TurnWorkerConfig};
use parking_lot::Mutex;

/// Adapter that replays a script of outcomes, then succeeds.
struct ScriptedSender {
    script: Mutex<VecDeque<Result<(), String>>>,
    calls: Mutex<Vec<DeliveryRequest>>,
}

impl ScriptedSender {
    fn new(script: Vec<Result<(), String>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl SendFinal for ScriptedSender {
    async fn send_final(
        &self,
        request: &DeliveryRequest,
    ) -> Result<DeliveryReceipt, ChannelError> {
        self.calls.lock().push(request.clone());
        match self.script.lock().pop_front() {
            Some(Err(message)) => Err(ChannelError::Delivery(message)),
            _ => Ok(DeliveryReceipt {
                sent: request.payloads.len(),
                provider_message_id: None,
            }),
        }
    }
}

struct FinalReplier;

#[async_trait]
impl ReplyResolver for FinalReplier {
    async fn resolve(
        &self,
        _ctx: &MsgContext,
        dispatcher: &ReplyDispatcher,
    ) -> anyhow::Result<()> {
        dispatcher
            .send_final_reply(vec![ReplyPayload::text("recovered reply")])
            .await
    }
}

fn ctx(sid: &str) -> MsgContext {
    MsgContext {
        body: Some("hello".to_string()),
        originating_channel: Some("whatsapp".to_string()),
        account_id: Some("acct-1".to_string()),
        session_key: "agent:whatsapp:+1555".to_string(),
        to: Some("+1555".to_string()),
        message_sid: Some(sid.to_string()),
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

struct Harness {
    store: Arc<StateStore>,
    turns: Arc<TurnJournal>,
    outbox: Arc<OutboxJournal>,
    router: Arc<OutboundRouter>,
    sender: Arc<ScriptedSender>,
    state_dir: tempfile::TempDir,
}

impl Harness {
    async fn new(script: Vec<Result<(), String>>) -> Self {
        let store = StateStore::open_in_memory().await.unwrap();
        let turns = Arc::new(TurnJournal::new(store.clone()));
        let outbox = Arc::new(OutboxJournal::new(store.clone()));
        let sender = ScriptedSender::new(script);
        let router = Arc::new(OutboundRouter::new());
        router.register(ChannelAdapter::v2("whatsapp", sender.clone()));
        Self {
            store,
            turns,
            outbox,
            router,
            sender,
            state_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn outbox_worker(&self) -> OutboxWorker {
        OutboxWorker::new(
            self.outbox.clone(),
            self.router.clone(),
            self.state_dir.path().to_path_buf(),
            OutboxWorkerConfig {
                interval: Duration::from_millis(1000),
                ..OutboxWorkerConfig::default()
            },
        )
        // Everything already enqueued counts as a crash leftover.
        .with_startup_cutoff(gw_common::now_ms() + 60_000)
    }

    fn turn_worker(&self) -> TurnWorker {
        let driver = Arc::new(DispatchDriver::new(
            self.turns.clone(),
            self.outbox.clone(),
            DispatchPolicy::default(),
        ));
        TurnWorker::new(
            self.turns.clone(),
            self.outbox.clone(),
            driver,
            Arc::new(FinalReplier),
            self.router.clone(),
            TurnWorkerConfig::default(),
        )
    }

    async fn accepted_turn(&self, sid: &str) -> String {
        let outcome = self.turns.accept_turn(&ctx(sid)).await.unwrap();
        assert!(outcome.accepted);
        outcome.id
    }

    /// Make a turn look old enough for recovery to touch it.
    async fn age_turn(&self, turn_id: &str, by_ms: i64) {
        sqlx::query(
            "UPDATE message_turns SET accepted_at = accepted_at - ?, next_attempt_at = 0 WHERE id = ?",
        )
        .bind(by_ms)
        .bind(turn_id)
        .execute(self.store.pool())
        .await
        .unwrap();
    }

    /// Rewind a delivery's clock far enough that its backoff has elapsed.
    async fn clear_backoff(&self, delivery_id: &str) {
        sqlx::query(
            "UPDATE message_outbox \
             SET next_attempt_at = 0, \
                 last_attempt_at = last_attempt_at - 60000, \
                 queued_at = queued_at - 60000 \
             WHERE id = ?",
        )
        .bind(delivery_id)
        .execute(self.store.pool())
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn outbox_worker_retries_transient_failures_until_delivery() {
    let harness = Harness::new(vec![
        Err("network timeout".to_string()),
        Err("network timeout".to_string()),
        Ok(()),
    ])
    .await;
    let turn_id = harness.accepted_turn("msg-1").await;
    let delivery_id = harness
        .outbox
        .enqueue_delivery(EnqueueDelivery {
            turn_id: Some(turn_id.clone()),
            request: request(),
            ..EnqueueDelivery::default()
        })
        .await
        .unwrap();

    let worker = harness.outbox_worker();

    // First attempt fails and schedules backoff.
    let stats = worker.run_once().await;
    assert_eq!(stats.failed, 1);
    let row = harness.outbox.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::FailedRetryable);
    assert_eq!(row.attempt_count, 1);
    assert!(row.next_attempt_at >= row.last_attempt_at.unwrap() + 5_000);

    // Second attempt (backoff elapsed) fails again with a longer delay.
    harness.clear_backoff(&delivery_id).await;
    worker.run_once().await;
    let row = harness.outbox.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(row.attempt_count, 2);

    // Third attempt succeeds; the row and its turn converge on delivered.
    harness.clear_backoff(&delivery_id).await;
    let stats = worker.run_once().await;
    assert_eq!(stats.delivered, 1);
    assert_eq!(harness.sender.call_count(), 3);

    let row = harness.outbox.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Delivered);
    let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::Delivered);
}

#[tokio::test]
async fn outbox_worker_terminalizes_permanent_errors_on_first_attempt() {
    let harness = Harness::new(vec![Err("chat not found".to_string())]).await;
    let turn_id = harness.accepted_turn("msg-1").await;
    let delivery_id = harness
        .outbox
        .enqueue_delivery(EnqueueDelivery {
            turn_id: Some(turn_id.clone()),
            request: request(),
            ..EnqueueDelivery::default()
        })
        .await
        .unwrap();

    let worker = harness.outbox_worker();
    worker.run_once().await;

    assert_eq!(harness.sender.call_count(), 1);
    let row = harness.outbox.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::FailedTerminal);
    assert_eq!(row.error_class.as_deref(), Some("permanent"));

    let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::FailedTerminal);

    // No further attempts on later passes.
    worker.run_once().await;
    assert_eq!(harness.sender.call_count(), 1);
}

#[tokio::test]
async fn outbox_worker_expires_aged_rows_without_attempting_them() {
    let harness = Harness::new(vec![]).await;
    let delivery_id = harness
        .outbox
        .enqueue_delivery(EnqueueDelivery {
            request: request(),
            ..EnqueueDelivery::default()
        })
        .await
        .unwrap();
    // 31 minutes old.
    sqlx::query("UPDATE message_outbox SET queued_at = queued_at - 1860000 WHERE id = ?")
        .bind(&delivery_id)
        .execute(harness.store.pool())
        .await
        .unwrap();

    let worker = harness.outbox_worker();
    let stats = worker.run_once().await;

    assert_eq!(stats.expired, 1);
    assert_eq!(harness.sender.call_count(), 0, "deliver must never be called");
    let row = harness.outbox.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Expired);
    assert_eq!(row.terminal_reason.as_deref(), Some("expired"));
}

#[tokio::test]
async fn outbox_worker_imports_the_legacy_file_queue_once() {
    let harness = Harness::new(vec![Ok(())]).await;
    let queue_dir = harness.state_dir.path().join("delivery-queue");
    std::fs::create_dir_all(&queue_dir).unwrap();
    std::fs::write(
        queue_dir.join("old.json"),
        format!(
            r#"{{"id": "old-1", "channel": "whatsapp", "to": "+1555", "payloads": [{{"text": "m"}}], "enqueuedAt": {}, "retryCount": 0}}"#,
            gw_common::now_ms() - 5_000
        ),
    )
    .unwrap();

    let worker = harness.outbox_worker();
    let stats = worker.run_once().await;

    assert_eq!(stats.imported, 1);
    assert!(!queue_dir.join("old.json").exists());
    let row = harness.outbox.get_delivery("old-1").await.unwrap().unwrap();
    // Imported, then immediately drained by the same pass.
    assert_eq!(row.status, OutboxStatus::Delivered);
}

#[tokio::test]
async fn outbox_worker_leaves_live_rows_to_their_drivers() {
    let harness = Harness::new(vec![]).await;
    harness
        .outbox
        .enqueue_delivery(EnqueueDelivery {
            request: request(),
            ..EnqueueDelivery::default()
        })
        .await
        .unwrap();

    // Cutoff before the enqueue: the row is live, not a crash leftover.
    let worker = OutboxWorker::new(
        harness.outbox.clone(),
        harness.router.clone(),
        harness.state_dir.path().to_path_buf(),
        OutboxWorkerConfig::default(),
    )
    .with_startup_cutoff(gw_common::now_ms() - 60_000);

    let stats = worker.run_once().await;
    assert_eq!(stats.delivered + stats.failed + stats.deferred, 0);
    assert_eq!(harness.sender.call_count(), 0);
}

#[tokio::test]
async fn turn_worker_replays_orphan_turns_to_delivery() {
    let harness = Harness::new(vec![]).await;
    let turn_id = harness.accepted_turn("msg-1").await;
    harness.age_turn(&turn_id, 10_000).await;

    let worker = harness.turn_worker();
    let stats = worker.run_once().await;

    assert_eq!(stats.resumed, 1);
    assert_eq!(harness.sender.call_count(), 1);
    let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::Delivered);
}

#[tokio::test]
async fn turn_worker_records_failures_until_the_cap() {
    let harness = Harness::new(vec![]).await;
    let turn_id = harness.accepted_turn("msg-1").await;
    // Destroy the payload and the captured route so hydration fails.
    sqlx::query(
        "UPDATE message_turns SET payload = 'not json', route_channel = NULL, route_to = NULL WHERE id = ?",
    )
    .bind(&turn_id)
    .execute(harness.store.pool())
    .await
    .unwrap();

    let worker = harness.turn_worker();
    for expected_attempt in 1..=2 {
        harness.age_turn(&turn_id, 10_000).await;
        let stats = worker.run_once().await;
        assert_eq!(stats.recovery_failures, 1);
        let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::FailedRetryable);
        assert_eq!(turn.attempt_count, expected_attempt);
    }

    harness.age_turn(&turn_id, 10_000).await;
    worker.run_once().await;
    let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::FailedTerminal);
    assert_eq!(turn.terminal_reason.as_deref(), Some("invalid turn payload"));
}

#[tokio::test]
async fn turn_worker_defers_to_pending_outbox_rows() {
    let harness = Harness::new(vec![]).await;
    let turn_id = harness.accepted_turn("msg-1").await;
    harness
        .outbox
        .enqueue_delivery(EnqueueDelivery {
            turn_id: Some(turn_id.clone()),
            request: request(),
            ..EnqueueDelivery::default()
        })
        .await
        .unwrap();
    harness.age_turn(&turn_id, 10_000).await;

    let worker = harness.turn_worker();
    let stats = worker.run_once().await;

    // Not resumed, not finalized: the outbox-worker owns the queued row.
    assert_eq!(stats.resumed, 0);
    assert_eq!(stats.finalized, 0);
    assert_eq!(harness.sender.call_count(), 0);
    let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
    assert!(!turn.status.is_terminal());
}

#[tokio::test]
async fn turn_worker_finalizes_turns_whose_outbox_already_resolved() {
    let harness = Harness::new(vec![]).await;
    let turn_id = harness.accepted_turn("msg-1").await;
    let delivery_id = harness
        .outbox
        .enqueue_delivery(EnqueueDelivery {
            turn_id: Some(turn_id.clone()),
            request: request(),
            ..EnqueueDelivery::default()
        })
        .await
        .unwrap();

    // Deliver the row but sever the coupling by resetting the turn, as if
    // the process died between the ack and the turn update.
    harness.outbox.ack_delivery(&delivery_id).await.unwrap();
    sqlx::query("UPDATE message_turns SET status = 'running', completed_at = NULL WHERE id = ?")
        .bind(&turn_id)
        .execute(harness.store.pool())
        .await
        .unwrap();
    harness.age_turn(&turn_id, 10_000).await;

    let worker = harness.turn_worker();
    let stats = worker.run_once().await;

    assert_eq!(stats.finalized, 1);
    let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::Delivered);
}

#[tokio::test]
async fn turn_worker_sweeps_stale_turns_terminally() {
    let harness = Harness::new(vec![]).await;
    let turn_id = harness.accepted_turn("msg-1").await;
    // Older than the 24 h recovery window.
    harness.age_turn(&turn_id, 25 * 60 * 60 * 1000).await;

    let worker = harness.turn_worker();
    let stats = worker.run_once().await;

    assert_eq!(stats.stale_failed, 1);
    let turn = harness.turns.get_turn(&turn_id).await.unwrap().unwrap();
    assert_eq!(turn.status, TurnStatus::FailedTerminal);
}
