use gw_common::{MsgContext, RouteTarget, ThreadId};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Lifecycle state of a turn row. The last three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Accepted,
    Running,
    DeliveryPending,
    FailedRetryable,
    Delivered,
    Aborted,
    FailedTerminal,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Accepted => "accepted",
            TurnStatus::Running => "running",
            TurnStatus::DeliveryPending => "delivery_pending",
            TurnStatus::FailedRetryable => "failed_retryable",
            TurnStatus::Delivered => "delivered",
            TurnStatus::Aborted => "aborted",
            TurnStatus::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(TurnStatus::Accepted),
            "running" => Some(TurnStatus::Running),
            "delivery_pending" => Some(TurnStatus::DeliveryPending),
            "failed_retryable" => Some(TurnStatus::FailedRetryable),
            "delivered" => Some(TurnStatus::Delivered),
            "aborted" => Some(TurnStatus::Aborted),
            "failed_terminal" => Some(TurnStatus::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnStatus::Delivered | TurnStatus::Aborted | TurnStatus::FailedTerminal
        )
    }
}

impl std::fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `message_turns` row.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub id: String,
    pub channel: String,
    pub account_id: Option<String>,
    pub external_id: Option<String>,
    pub dedupe_key: Option<String>,
    pub session_key: String,
    pub payload: String,
    pub route_channel: Option<String>,
    pub route_to: Option<String>,
    pub route_account_id: Option<String>,
    pub route_thread_id: Option<String>,
    pub route_reply_to_id: Option<String>,
    pub status: TurnStatus,
    pub accepted_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub attempt_count: i64,
    pub next_attempt_at: i64,
    pub terminal_reason: Option<String>,
}

impl TurnRecord {
    pub(crate) fn from_row(row: &SqliteRow) -> anyhow::Result<Self> {
        let status_text: String = row.get("status");
        let status = TurnStatus::parse(&status_text)
            .ok_or_else(|| anyhow::anyhow!("unknown turn status: {status_text}"))?;

        Ok(Self {
            id: row.get("id"),
            channel: row.get("channel"),
            account_id: row.get("account_id"),
            external_id: row.get("external_id"),
            dedupe_key: row.get("dedupe_key"),
            session_key: row.get("session_key"),
            payload: row.get("payload"),
            route_channel: row.get("route_channel"),
            route_to: row.get("route_to"),
            route_account_id: row.get("route_account_id"),
            route_thread_id: row.get("route_thread_id"),
            route_reply_to_id: row.get("route_reply_to_id"),
            status,
            accepted_at: row.get("accepted_at"),
            updated_at: row.get("updated_at"),
            completed_at: row.get("completed_at"),
            attempt_count: row.get("attempt_count"),
            next_attempt_at: row.get("next_attempt_at"),
            terminal_reason: row.get("terminal_reason"),
        })
    }

    /// Reconstruct the canonical context and reply route for resume.
    ///
    /// The payload tolerates legacy key spellings. Returns `None` when
    /// neither the captured route nor the context itself can produce a
    /// channel and destination.
    pub fn hydrate(&self) -> Option<(MsgContext, RouteTarget)> {
        let ctx: MsgContext = serde_json::from_str(&self.payload).ok()?;

        let captured = match (&self.route_channel, &self.route_to) {
            (Some(channel), Some(to)) if !channel.is_empty() && !to.is_empty() => {
                Some(RouteTarget {
                    channel: channel.clone(),
                    to: to.clone(),
                    account_id: self.route_account_id.clone(),
                    thread_id: self
                        .route_thread_id
                        .clone()
                        .map(|raw| match raw.parse::<i64>() {
                            Ok(n) => ThreadId::Number(n),
                            Err(_) => ThreadId::Text(raw),
                        }),
                    reply_to_id: self.route_reply_to_id.clone(),
                })
            }
            _ => None,
        };

        let route = captured.or_else(|| RouteTarget::from_context(&ctx))?;
        Some((ctx, route))
    }
}
