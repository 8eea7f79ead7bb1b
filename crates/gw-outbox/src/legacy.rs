//! One-shot import of the legacy JSON file queue.
//!
//! Older gateways persisted pending deliveries as one JSON file per send in
//! `<stateDir>/delivery-queue/`. The import folds them into the outbox table
//! keyed by the file's own id, so it is idempotent and a no-op once the
//! directory is empty.

use std::path::Path;

use anyhow::Result;
use gw_common::{now_ms, DeliveryRequest, ReplyPayload, ThreadId};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::journal::OutboxJournal;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyQueuedDelivery {
    id: String,
    channel: String,
    to: String,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    payloads: Vec<ReplyPayload>,
    #[serde(default)]
    thread_id: Option<ThreadId>,
    #[serde(default)]
    reply_to_id: Option<String>,
    #[serde(default)]
    best_effort: Option<bool>,
    #[serde(default)]
    enqueued_at: Option<i64>,
    #[serde(default)]
    retry_count: i64,
    #[serde(default)]
    last_attempt_at: Option<i64>,
}

/// Import every `*.json` entry from `<state_dir>/delivery-queue/` into the
/// outbox, unlinking each file once its row exists. Malformed entries are
/// skipped and left in place. Returns the number of files absorbed.
pub async fn import_legacy_file_queue(journal: &OutboxJournal, state_dir: &Path) -> Result<u64> {
    let queue_dir = state_dir.join("delivery-queue");
    if !queue_dir.is_dir() {
        return Ok(0);
    }

    let mut imported = 0u64;
    for entry in std::fs::read_dir(&queue_dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "Unreadable legacy queue entry, skipping");
                continue;
            }
        };
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let parsed: LegacyQueuedDelivery = match std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(serde_json::from_str(&raw)?))
        {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Malformed legacy queue entry, skipping");
                continue;
            }
        };

        let request = DeliveryRequest {
            channel: parsed.channel,
            to: parsed.to,
            account_id: parsed.account_id,
            payloads: parsed.payloads,
            thread_id: parsed.thread_id,
            reply_to_id: parsed.reply_to_id,
            best_effort: parsed.best_effort,
            ..DeliveryRequest::default()
        };
        let payload = serde_json::to_string(&request)?;
        let queued_at = parsed.enqueued_at.unwrap_or_else(now_ms);

        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_outbox \
             (id, turn_id, channel, account_id, target, payload, \
              queued_at, status, attempt_count, next_attempt_at, last_attempt_at) \
             VALUES (?, NULL, ?, ?, ?, ?, ?, 'queued', ?, ?, ?)",
        )
        .bind(&parsed.id)
        .bind(&request.channel)
        .bind(&request.account_id)
        .bind(&request.to)
        .bind(&payload)
        .bind(queued_at)
        .bind(parsed.retry_count)
        .bind(now_ms())
        .bind(parsed.last_attempt_at)
        .execute(journal.store().pool())
        .await;

        match result {
            Ok(done) => {
                if done.rows_affected() == 1 {
                    imported += 1;
                    debug!(delivery_id = %parsed.id, "Imported legacy delivery");
                }
                // Row exists either way; the file has served its purpose.
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "Could not unlink imported legacy entry");
                }
            }
            Err(err) => {
                warn!(delivery_id = %parsed.id, error = %err, "Legacy import insert failed");
            }
        }
    }

    if imported > 0 {
        info!(count = imported, "Imported legacy delivery queue");
    }
    Ok(imported)
}
