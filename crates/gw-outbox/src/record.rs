use gw_common::DeliveryRequest;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Lifecycle state of an outbox row. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Queued,
    FailedRetryable,
    Delivered,
    FailedTerminal,
    Expired,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Queued => "queued",
            OutboxStatus::FailedRetryable => "failed_retryable",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::FailedTerminal => "failed_terminal",
            OutboxStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(OutboxStatus::Queued),
            "failed_retryable" => Some(OutboxStatus::FailedRetryable),
            "delivered" => Some(OutboxStatus::Delivered),
            "failed_terminal" => Some(OutboxStatus::FailedTerminal),
            "expired" => Some(OutboxStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutboxStatus::Delivered | OutboxStatus::FailedTerminal | OutboxStatus::Expired
        )
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `message_outbox` row.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: String,
    pub turn_id: Option<String>,
    pub channel: String,
    pub account_id: Option<String>,
    pub target: String,
    pub payload: String,
    pub idempotency_key: Option<String>,
    pub queued_at: i64,
    pub status: OutboxStatus,
    pub attempt_count: i64,
    pub next_attempt_at: i64,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub error_class: Option<String>,
    pub terminal_reason: Option<String>,
    pub delivered_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl OutboxRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> anyhow::Result<Self> {
        let status_text: String = row.get("status");
        let status = OutboxStatus::parse(&status_text)
            .ok_or_else(|| anyhow::anyhow!("unknown outbox status: {status_text}"))?;

        Ok(Self {
            id: row.get("id"),
            turn_id: row.get("turn_id"),
            channel: row.get("channel"),
            account_id: row.get("account_id"),
            target: row.get("target"),
            payload: row.get("payload"),
            idempotency_key: row.get("idempotency_key"),
            queued_at: row.get("queued_at"),
            status,
            attempt_count: row.get("attempt_count"),
            next_attempt_at: row.get("next_attempt_at"),
            last_attempt_at: row.get("last_attempt_at"),
            last_error: row.get("last_error"),
            error_class: row.get("error_class"),
            terminal_reason: row.get("terminal_reason"),
            delivered_at: row.get("delivered_at"),
            completed_at: row.get("completed_at"),
        })
    }

    /// Deserialize the stored delivery request.
    pub fn request(&self) -> anyhow::Result<DeliveryRequest> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}
